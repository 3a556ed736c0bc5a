//! Data access port trait.

use crate::domain::bar::Bar;
use crate::domain::error::OrbError;
use crate::domain::request::HistoricalBarsRequest;

pub trait DataPort {
    /// Every bar the request yields, in arrival order. Never returns an
    /// empty `Ok`: no bars is `OrbError::EmptyResult`.
    fn fetch_bars(&mut self, request: &HistoricalBarsRequest) -> Result<Vec<Bar>, OrbError>;
}
