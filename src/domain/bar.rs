//! Intraday OHLCV bar and candle geometry.

use chrono::{NaiveDateTime, NaiveTime};

use super::error::OrbError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn time(&self) -> NaiveTime {
        self.timestamp.time()
    }

    /// |open - close|
    pub fn body_size(&self) -> f64 {
        (self.open - self.close).abs()
    }

    /// low - min(open, close). Non-positive for any well-formed bar.
    pub fn tail_size(&self) -> f64 {
        self.low - self.open.min(self.close)
    }

    pub fn is_hammer(&self) -> bool {
        is_hammer(self.open, self.high, self.low, self.close)
    }

    /// What makes this bar unusable as a candle, if anything: a non-finite
    /// value, a negative volume, or open/close outside `[low, high]`.
    pub fn inconsistency(&self) -> Option<&'static str> {
        let values = [self.open, self.high, self.low, self.close, self.volume];
        if values.iter().any(|v| !v.is_finite()) {
            Some("non-finite value")
        } else if self.volume < 0.0 {
            Some("negative volume")
        } else if self.low > self.high {
            Some("low above high")
        } else if self.low > self.open.min(self.close) {
            Some("open or close below low")
        } else if self.open.max(self.close) > self.high {
            Some("open or close above high")
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<(), OrbError> {
        match self.inconsistency() {
            None => Ok(()),
            Some(problem) => Err(OrbError::Data {
                reason: format!(
                    "{problem} in bar at {} (o={} h={} l={} c={} v={})",
                    self.timestamp, self.open, self.high, self.low, self.close, self.volume
                ),
            }),
        }
    }
}

/// Check every bar, failing on the first inconsistent one.
pub fn validate_bars(bars: &[Bar]) -> Result<(), OrbError> {
    bars.iter().try_for_each(Bar::validate)
}

/// Simplified hammer test: `tail >= 0.5 * body` with
/// `tail = low - min(open, close)`. No upper-shadow condition is applied.
pub fn is_hammer(open: f64, _high: f64, low: f64, close: f64) -> bool {
    let body_size = (open - close).abs();
    let tail_size = low - open.min(close);
    tail_size >= 0.5 * body_size
}
