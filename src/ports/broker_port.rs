//! Brokerage connection port: a connection driver and the callback sink it feeds.

use chrono::NaiveDateTime;
use std::time::Duration;

use crate::domain::bar::Bar;
use crate::domain::error::OrbError;
use crate::domain::request::{ConnectionParams, HistoricalBarsRequest};

pub type RequestId = i32;

/// Receives inbound market-data callbacks. Called only from the thread that
/// owns the connection.
pub trait BarSink {
    fn on_bar(&mut self, request_id: RequestId, bar: Bar);

    /// Revision of the most recent bar (streaming requests).
    fn on_bar_update(&mut self, request_id: RequestId, bar: Bar);

    fn on_stream_end(
        &mut self,
        request_id: RequestId,
        range_start: NaiveDateTime,
        range_end: NaiveDateTime,
    );

    /// The brokerage rejected or aborted the request.
    fn on_request_error(&mut self, request_id: RequestId, reason: &str);
}

/// Outbound side of a brokerage session. Implementations are moved onto a
/// dedicated worker thread and driven from there.
pub trait BrokerConnection: Send {
    fn connect(&mut self, params: &ConnectionParams) -> Result<(), OrbError>;

    fn request_historical_bars(
        &mut self,
        request_id: RequestId,
        request: &HistoricalBarsRequest,
    ) -> Result<(), OrbError>;

    /// Dispatch pending inbound messages to `sink`. Must return within
    /// roughly `wait`, blocking for at most that long when idle. An error
    /// means the session is lost.
    fn pump(&mut self, sink: &mut dyn BarSink, wait: Duration) -> Result<(), OrbError>;

    fn disconnect(&mut self);
}
