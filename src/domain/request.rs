//! Brokerage connection and historical-data request parameters.

use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use std::fmt;
use std::str::FromStr;

use super::error::OrbError;

/// Timestamp layout used by the brokerage for bar dates and end times.
pub const BROKER_DATETIME_FORMAT: &str = "%Y%m%d %H:%M:%S";

/// Regular trading hours, `[open, close)`.
pub const RTH_OPEN: (u32, u32) = (9, 30);
pub const RTH_CLOSE: (u32, u32) = (16, 0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 1,
        }
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (client {})", self.host, self.port, self.client_id)
    }
}

/// Instrument identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
}

impl Contract {
    pub fn stock(symbol: &str) -> Self {
        Contract {
            symbol: symbol.to_uppercase(),
            sec_type: "STK".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
        }
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}/{}",
            self.symbol, self.sec_type, self.exchange, self.currency
        )
    }
}

/// Lookback window of a historical request, e.g. `1 D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryDuration {
    Seconds(u32),
    /// Trading sessions.
    Days(u32),
    Weeks(u32),
}

impl HistoryDuration {
    /// Number of sessions the window spans, if it is session-based.
    pub fn sessions(&self) -> Option<usize> {
        match self {
            HistoryDuration::Seconds(_) => None,
            HistoryDuration::Days(n) => Some(*n as usize),
            HistoryDuration::Weeks(n) => Some(*n as usize * 5),
        }
    }
}

impl FromStr for HistoryDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = split_count_unit(s)?;
        match unit.to_uppercase().as_str() {
            "S" => Ok(HistoryDuration::Seconds(count)),
            "D" => Ok(HistoryDuration::Days(count)),
            "W" => Ok(HistoryDuration::Weeks(count)),
            other => Err(format!("unknown duration unit '{other}' (expected S, D or W)")),
        }
    }
}

impl fmt::Display for HistoryDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryDuration::Seconds(n) => write!(f, "{n} S"),
            HistoryDuration::Days(n) => write!(f, "{n} D"),
            HistoryDuration::Weeks(n) => write!(f, "{n} W"),
        }
    }
}

/// Bar interval, e.g. `1 min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarSize {
    seconds: u32,
}

impl BarSize {
    pub fn one_minute() -> Self {
        BarSize { seconds: 60 }
    }

    pub fn as_delta(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.seconds))
    }
}

impl FromStr for BarSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = split_count_unit(s)?;
        let scale = match unit.to_lowercase().as_str() {
            "sec" | "secs" => 1,
            "min" | "mins" => 60,
            "hour" | "hours" => 3_600,
            "day" => 86_400,
            other => return Err(format!("unknown bar size unit '{other}'")),
        };
        Ok(BarSize {
            seconds: count * scale,
        })
    }
}

impl fmt::Display for BarSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.seconds {
            s if s % 86_400 == 0 => write!(f, "{} day", s / 86_400),
            s if s % 3_600 == 0 => write!(f, "{} hours", s / 3_600),
            s if s % 60 == 0 => write!(f, "{} min", s / 60),
            s => write!(f, "{s} secs"),
        }
    }
}

fn split_count_unit(s: &str) -> Result<(u32, &str), String> {
    let mut parts = s.split_whitespace();
    let (Some(count), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected '<count> <unit>', got '{s}'"));
    };
    let count: u32 = count
        .parse()
        .map_err(|_| format!("invalid count '{count}'"))?;
    if count == 0 {
        return Err("count must be at least 1".to_string());
    }
    Ok((count, unit))
}

/// One historical-bars request.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalBarsRequest {
    pub contract: Contract,
    /// `None` means "now".
    pub end_time: Option<NaiveDateTime>,
    pub duration: HistoryDuration,
    pub bar_size: BarSize,
    pub what_to_show: String,
    pub use_rth: bool,
    pub keep_up_to_date: bool,
}

impl HistoricalBarsRequest {
    /// One regular-hours session of one-minute trade bars.
    pub fn intraday(contract: Contract) -> Self {
        HistoricalBarsRequest {
            contract,
            end_time: None,
            duration: HistoryDuration::Days(1),
            bar_size: BarSize::one_minute(),
            what_to_show: "TRADES".to_string(),
            use_rth: true,
            keep_up_to_date: false,
        }
    }
}

/// True when `time` lies inside regular trading hours.
pub fn in_regular_hours(time: NaiveTime) -> bool {
    let open = NaiveTime::from_hms_opt(RTH_OPEN.0, RTH_OPEN.1, 0).unwrap_or_default();
    let close = NaiveTime::from_hms_opt(RTH_CLOSE.0, RTH_CLOSE.1, 0).unwrap_or_default();
    time >= open && time < close
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, String> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| format!("invalid time '{value}', expected HH:MM or HH:MM:SS"))
}

/// Parse a bar or end-time timestamp in any of the accepted layouts.
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, OrbError> {
    let value = value.trim();
    const FORMATS: [&str; 3] = [
        BROKER_DATETIME_FORMAT,
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .ok_or_else(|| OrbError::Data {
            reason: format!("invalid timestamp '{value}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_durations() {
        assert_eq!("1 D".parse::<HistoryDuration>(), Ok(HistoryDuration::Days(1)));
        assert_eq!("2 w".parse::<HistoryDuration>(), Ok(HistoryDuration::Weeks(2)));
        assert_eq!("3600 S".parse::<HistoryDuration>(), Ok(HistoryDuration::Seconds(3600)));
        assert!("0 D".parse::<HistoryDuration>().is_err());
        assert!("1 Y".parse::<HistoryDuration>().is_err());
        assert!("1D".parse::<HistoryDuration>().is_err());
    }

    #[test]
    fn duration_sessions() {
        assert_eq!(HistoryDuration::Days(2).sessions(), Some(2));
        assert_eq!(HistoryDuration::Weeks(1).sessions(), Some(5));
        assert_eq!(HistoryDuration::Seconds(60).sessions(), None);
    }

    #[test]
    fn parses_bar_sizes() {
        assert_eq!("1 min".parse::<BarSize>().unwrap(), BarSize::one_minute());
        assert_eq!(
            "5 mins".parse::<BarSize>().unwrap().as_delta(),
            TimeDelta::minutes(5)
        );
        assert_eq!(
            "30 secs".parse::<BarSize>().unwrap().as_delta(),
            TimeDelta::seconds(30)
        );
        assert!("1 fortnight".parse::<BarSize>().is_err());
    }

    #[test]
    fn bar_size_display() {
        assert_eq!(BarSize::one_minute().to_string(), "1 min");
        assert_eq!("2 hours".parse::<BarSize>().unwrap().to_string(), "2 hours");
    }

    #[test]
    fn regular_hours_boundaries() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(!in_regular_hours(t(9, 29)));
        assert!(in_regular_hours(t(9, 30)));
        assert!(in_regular_hours(t(15, 59)));
        assert!(!in_regular_hours(t(16, 0)));
    }

    #[test]
    fn parses_time_of_day() {
        assert_eq!(
            parse_time_of_day("09:30").unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap()
        );
        assert_eq!(
            parse_time_of_day("11:00:30").unwrap(),
            NaiveTime::from_hms_opt(11, 0, 30).unwrap()
        );
        assert!(parse_time_of_day("9.30").is_err());
    }

    #[test]
    fn parses_timestamps() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("20240102 09:30:00").unwrap(), expected);
        assert_eq!(parse_timestamp("20240102  09:30:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-02 09:30:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-02T09:30:00").unwrap(), expected);
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(OrbError::Data { .. })
        ));
    }

    #[test]
    fn intraday_request_defaults() {
        let req = HistoricalBarsRequest::intraday(Contract::stock("spy"));
        assert_eq!(req.contract.symbol, "SPY");
        assert_eq!(req.duration, HistoryDuration::Days(1));
        assert!(req.use_rth);
        assert!(!req.keep_up_to_date);
        assert!(req.end_time.is_none());
    }
}
