//! Opening-range strategy parameters.

use chrono::NaiveTime;

use super::error::OrbError;

/// Fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyParams {
    /// Take-profit distance in range widths.
    pub target: f64,
    /// Stop distance in range widths. Configured as `stop`, or `risk` when `stop` is absent.
    pub stop: f64,
    /// First bar at or after this time defines the opening range.
    pub check_time: NaiveTime,
    /// Bar count since run start after which an open position is closed.
    pub entry_time: i64,
    /// Reserved for partial exits. Validated but not acted on.
    pub scale_out: f64,
    /// Breakout/entry window, inclusive at both ends.
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
}

impl Default for StrategyParams {
    fn default() -> Self {
        StrategyParams {
            target: 2.0,
            stop: 1.0,
            check_time: hm(9, 30),
            entry_time: 60,
            scale_out: 0.5,
            window_start: hm(9, 30),
            window_end: hm(11, 0),
        }
    }
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default()
}

impl StrategyParams {
    pub fn validate(&self) -> Result<(), OrbError> {
        if !(self.target.is_finite() && self.target > 0.0) {
            return Err(OrbError::invalid("strategy", "target", "target must be positive"));
        }
        if !(self.stop.is_finite() && self.stop > 0.0) {
            return Err(OrbError::invalid("strategy", "stop", "stop must be positive"));
        }
        if self.entry_time <= 0 {
            return Err(OrbError::invalid(
                "strategy",
                "entry_time",
                "entry_time must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.scale_out) {
            return Err(OrbError::invalid(
                "strategy",
                "scale_out",
                "scale_out must be between 0 and 1",
            ));
        }
        if self.window_start > self.window_end {
            return Err(OrbError::invalid(
                "strategy",
                "window_start",
                "window_start must not be after window_end",
            ));
        }
        Ok(())
    }

    pub fn in_window(&self, time: NaiveTime) -> bool {
        time >= self.window_start && time <= self.window_end
    }

    /// `entry_time` as a bar count; only meaningful after `validate`.
    pub fn exit_after_bars(&self) -> usize {
        usize::try_from(self.entry_time).unwrap_or(usize::MAX)
    }
}
