//! Opening range band.

use super::bar::Bar;

/// High/low of the single bar that closed the opening range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpeningRange {
    pub high: f64,
    pub low: f64,
}

impl OpeningRange {
    pub fn from_bar(bar: &Bar) -> Self {
        OpeningRange {
            high: bar.high,
            low: bar.low,
        }
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    /// Close at or above `high + width`.
    pub fn is_breakout(&self, close: f64) -> bool {
        close >= self.high + self.width()
    }

    /// Close back inside the band: below the high, not below the low.
    pub fn is_retracement(&self, close: f64) -> bool {
        close < self.high && close >= self.low
    }
}
