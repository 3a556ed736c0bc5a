//! A `BrokerConnection` that plays a recorded CSV session back through the
//! callback interface, for offline runs and tests.

use chrono::{Local, NaiveDateTime, TimeDelta};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::adapters::csv_adapter;
use crate::domain::bar::Bar;
use crate::domain::error::OrbError;
use crate::domain::request::{
    ConnectionParams, HistoricalBarsRequest, HistoryDuration, in_regular_hours,
};
use crate::ports::broker_port::{BarSink, BrokerConnection, RequestId};

enum Message {
    Bar(Bar),
    Update(Bar),
    End {
        range_start: NaiveDateTime,
        range_end: NaiveDateTime,
    },
}

pub struct ReplayConnection {
    path: PathBuf,
    latency: Duration,
    bars: Vec<Bar>,
    connected: bool,
    outbox: VecDeque<(RequestId, Message)>,
}

impl ReplayConnection {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ReplayConnection {
            path: path.into(),
            latency: Duration::ZERO,
            bars: Vec::new(),
            connected: false,
            outbox: VecDeque::new(),
        }
    }

    /// Delay before each delivered callback.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Bars of `bars` a brokerage would return for `request`, in timestamp order.
pub fn select_window(bars: &[Bar], request: &HistoricalBarsRequest) -> Vec<Bar> {
    let mut selected: Vec<Bar> = bars
        .iter()
        .filter(|b| request.end_time.is_none_or(|end| b.timestamp < end))
        .filter(|b| !request.use_rth || in_regular_hours(b.time()))
        .copied()
        .collect();
    selected.sort_by_key(|b| b.timestamp);

    match request.duration {
        HistoryDuration::Seconds(seconds) => {
            let Some(last) = selected.last() else {
                return selected;
            };
            let anchor = request
                .end_time
                .unwrap_or(last.timestamp + request.bar_size.as_delta());
            let start = anchor - TimeDelta::seconds(i64::from(seconds));
            selected.retain(|b| b.timestamp >= start);
        }
        duration => {
            let sessions = duration.sessions().unwrap_or(1);
            let dates: BTreeSet<_> = selected.iter().map(|b| b.timestamp.date()).collect();
            if let Some(first_kept) = dates.iter().rev().take(sessions).last().copied() {
                selected.retain(|b| b.timestamp.date() >= first_kept);
            }
        }
    }
    selected
}

impl BrokerConnection for ReplayConnection {
    fn connect(&mut self, params: &ConnectionParams) -> Result<(), OrbError> {
        self.bars = csv_adapter::read_bars(&self.path).map_err(|e| match e {
            OrbError::Data { reason } => OrbError::Data {
                reason: format!("{}: {reason}", self.path.display()),
            },
            other => {
                OrbError::connection(format!("cannot open replay {}: {other}", self.path.display()))
            }
        })?;
        self.connected = true;
        info!(%params, file = %self.path.display(), bars = self.bars.len(), "replay session opened");
        Ok(())
    }

    fn request_historical_bars(
        &mut self,
        request_id: RequestId,
        request: &HistoricalBarsRequest,
    ) -> Result<(), OrbError> {
        if !self.connected {
            return Err(OrbError::connection("replay session not connected"));
        }

        let window = select_window(&self.bars, request);
        debug!(request_id, bars = window.len(), contract = %request.contract, "replaying window");

        let fallback = request
            .end_time
            .unwrap_or_else(|| Local::now().naive_local());
        let range_start = window.first().map_or(fallback, |b| b.timestamp);
        let range_end = window.last().map_or(fallback, |b| b.timestamp);
        let last = window.last().copied();

        self.outbox
            .extend(window.into_iter().map(|b| (request_id, Message::Bar(b))));
        self.outbox.push_back((
            request_id,
            Message::End {
                range_start,
                range_end,
            },
        ));
        if request.keep_up_to_date {
            if let Some(bar) = last {
                self.outbox.push_back((request_id, Message::Update(bar)));
            }
        }
        Ok(())
    }

    fn pump(&mut self, sink: &mut dyn BarSink, wait: Duration) -> Result<(), OrbError> {
        if self.outbox.is_empty() {
            thread::sleep(wait);
            return Ok(());
        }

        let deadline = Instant::now() + wait;
        while let Some((request_id, message)) = self.outbox.pop_front() {
            if !self.latency.is_zero() {
                thread::sleep(self.latency);
            }
            match message {
                Message::Bar(bar) => sink.on_bar(request_id, bar),
                Message::Update(bar) => sink.on_bar_update(request_id, bar),
                Message::End {
                    range_start,
                    range_end,
                } => sink.on_stream_end(request_id, range_start, range_end),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            debug!(file = %self.path.display(), "replay session closed");
        }
        self.connected = false;
        self.outbox.clear();
    }
}
