//! Configuration validation.
//!
//! Validates every INI section before a connection is opened.

use crate::domain::error::OrbError;
use crate::domain::request::{BarSize, HistoryDuration, parse_time_of_day, parse_timestamp};
use crate::ports::config_port::ConfigPort;
use chrono::NaiveTime;

pub fn validate_connection_config(config: &dyn ConfigPort) -> Result<(), OrbError> {
    let port = int_setting(config, "connection", "port", 7497)?;
    if !(1..=65535).contains(&port) {
        return Err(OrbError::invalid(
            "connection",
            "port",
            "port must be between 1 and 65535",
        ));
    }
    let client_id = int_setting(config, "connection", "client_id", 1)?;
    if i32::try_from(client_id).is_err() {
        return Err(OrbError::invalid(
            "connection",
            "client_id",
            "client_id does not fit in 32 bits",
        ));
    }
    if config.get_string_or("connection", "host", "127.0.0.1").is_empty() {
        return Err(OrbError::ConfigMissing {
            section: "connection".to_string(),
            key: "host".to_string(),
        });
    }
    validate_positive_int(config, "connection", "connect_timeout_secs", 5)?;
    if int_setting(config, "connection", "replay_latency_ms", 0)? < 0 {
        return Err(OrbError::invalid(
            "connection",
            "replay_latency_ms",
            "replay_latency_ms must be non-negative",
        ));
    }
    Ok(())
}

pub fn validate_request_config(config: &dyn ConfigPort) -> Result<(), OrbError> {
    let duration = config.get_string_or("request", "duration", "1 D");
    duration
        .parse::<HistoryDuration>()
        .map_err(|reason| OrbError::invalid("request", "duration", reason))?;

    let bar_size = config.get_string_or("request", "bar_size", "1 min");
    bar_size
        .parse::<BarSize>()
        .map_err(|reason| OrbError::invalid("request", "bar_size", reason))?;

    if let Some(end_time) = config
        .get_string("request", "end_time")
        .filter(|s| !s.trim().is_empty())
    {
        parse_timestamp(&end_time).map_err(|_| {
            OrbError::invalid(
                "request",
                "end_time",
                "invalid end_time format, expected YYYYMMDD HH:MM:SS",
            )
        })?;
    }

    validate_positive_int(config, "request", "timeout_secs", 10)?;
    bool_setting(config, "request", "use_rth", true)?;
    bool_setting(config, "request", "keep_up_to_date", false)?;
    Ok(())
}

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), OrbError> {
    let capital = float_setting(config, "backtest", "initial_capital", 100_000.0)?;
    if capital <= 0.0 {
        return Err(OrbError::invalid(
            "backtest",
            "initial_capital",
            "initial_capital must be positive",
        ));
    }
    let pct = float_setting(config, "backtest", "commission_pct", 0.1)?;
    if pct < 0.0 {
        return Err(OrbError::invalid(
            "backtest",
            "commission_pct",
            "commission_pct must be non-negative",
        ));
    }
    validate_positive_int(config, "backtest", "stake", 1)?;
    Ok(())
}

pub fn validate_strategy_config(config: &dyn ConfigPort) -> Result<(), OrbError> {
    let target = float_setting(config, "strategy", "target", 2.0)?;
    if target <= 0.0 {
        return Err(OrbError::invalid("strategy", "target", "target must be positive"));
    }
    let (stop_key, stop) = stop_setting(config)?;
    if stop <= 0.0 {
        return Err(OrbError::invalid(
            "strategy",
            stop_key,
            format!("{stop_key} must be positive"),
        ));
    }
    if int_setting(config, "strategy", "entry_time", 60)? < 1 {
        return Err(OrbError::invalid(
            "strategy",
            "entry_time",
            "entry_time must be at least 1",
        ));
    }
    let scale_out = float_setting(config, "strategy", "scale_out", 0.5)?;
    if !(0.0..=1.0).contains(&scale_out) {
        return Err(OrbError::invalid(
            "strategy",
            "scale_out",
            "scale_out must be between 0 and 1",
        ));
    }

    parse_time(config, "check_time", "09:30")?;
    let start = parse_time(config, "window_start", "09:30")?;
    let end = parse_time(config, "window_end", "11:00")?;
    if start > end {
        return Err(OrbError::invalid(
            "strategy",
            "window_start",
            "window_start must not be after window_end",
        ));
    }
    Ok(())
}

/// The stop multiple and the key it came from: `stop`, else `risk`.
pub fn stop_setting(config: &dyn ConfigPort) -> Result<(&'static str, f64), OrbError> {
    for key in ["stop", "risk"] {
        if raw_setting(config, "strategy", key).is_some() {
            return Ok((key, float_setting(config, "strategy", key, 1.0)?));
        }
    }
    Ok(("stop", 1.0))
}

/// Parse an `HH:MM[:SS]` key of the `[strategy]` section.
pub fn parse_time(config: &dyn ConfigPort, key: &str, default: &str) -> Result<NaiveTime, OrbError> {
    let value = config.get_string_or("strategy", key, default);
    parse_time_of_day(&value).map_err(|reason| OrbError::invalid("strategy", key, reason))
}

fn raw_setting(config: &dyn ConfigPort, section: &str, key: &str) -> Option<String> {
    config
        .get_string(section, key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `[section] key` as an integer, `default` when absent or blank. A value
/// that is present but not an integer is `ConfigInvalid`.
pub fn int_setting(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<i64, OrbError> {
    match raw_setting(config, section, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            OrbError::invalid(section, key, format!("expected an integer, got '{raw}'"))
        }),
    }
}

/// Like [`int_setting`] for finite floating-point values.
pub fn float_setting(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<f64, OrbError> {
    let Some(raw) = raw_setting(config, section, key) else {
        return Ok(default);
    };
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(OrbError::invalid(
            section,
            key,
            format!("expected a number, got '{raw}'"),
        )),
    }
}

/// Like [`int_setting`] for `true/yes/1` and `false/no/0`.
pub fn bool_setting(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: bool,
) -> Result<bool, OrbError> {
    let Some(raw) = raw_setting(config, section, key) else {
        return Ok(default);
    };
    match raw.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(OrbError::invalid(
            section,
            key,
            format!("expected true or false, got '{raw}'"),
        )),
    }
}

fn validate_positive_int(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<(), OrbError> {
    if int_setting(config, section, key, default)? < 1 {
        return Err(OrbError::invalid(
            section,
            key,
            format!("{key} must be at least 1"),
        ));
    }
    Ok(())
}
