//! Replayable, timestamp-ordered bar stream handed to the backtest runner.

use tracing::warn;

use super::bar::{Bar, validate_bars};
use super::error::OrbError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFeed {
    bars: Vec<Bar>,
}

impl DataFeed {
    /// Takes ownership of a completed bar buffer. Out-of-order input is
    /// stably re-sorted by timestamp.
    pub fn new(mut bars: Vec<Bar>) -> Self {
        if !bars.is_sorted_by_key(|b| b.timestamp) {
            warn!(bars = bars.len(), "bar buffer out of timestamp order, sorting");
            bars.sort_by_key(|b| b.timestamp);
        }
        DataFeed { bars }
    }

    /// Like [`DataFeed::new`], but refuses a buffer holding any bar that is
    /// not OHLC-consistent.
    pub fn checked(bars: Vec<Bar>) -> Result<Self, OrbError> {
        validate_bars(&bars)?;
        Ok(DataFeed::new(bars))
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bar> {
        self.bars.iter()
    }

    /// Number of distinct calendar dates in the feed.
    pub fn sessions(&self) -> usize {
        let mut dates: Vec<_> = self.bars.iter().map(|b| b.timestamp.date()).collect();
        dates.dedup();
        dates.len()
    }
}

impl<'a> IntoIterator for &'a DataFeed {
    type Item = &'a Bar;
    type IntoIter = std::slice::Iter<'a, Bar>;

    fn into_iter(self) -> Self::IntoIter {
        self.bars.iter()
    }
}
