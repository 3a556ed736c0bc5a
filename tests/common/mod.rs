#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use orbtrader::domain::bar::Bar;
use orbtrader::domain::error::OrbError;
use orbtrader::domain::request::{ConnectionParams, HistoricalBarsRequest};
use orbtrader::ports::broker_port::{BarSink, BrokerConnection, RequestId};
use orbtrader::ports::data_port::DataPort;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub enum Reply {
    Bars(Vec<Bar>),
    Empty,
    Timeout,
}

/// `DataPort` returning a canned reply and recording every request.
pub struct MockDataPort {
    pub reply: Reply,
    pub requests: Vec<HistoricalBarsRequest>,
}

impl MockDataPort {
    pub fn with_bars(bars: Vec<Bar>) -> Self {
        Self {
            reply: Reply::Bars(bars),
            requests: Vec::new(),
        }
    }

    pub fn replying(reply: Reply) -> Self {
        Self {
            reply,
            requests: Vec::new(),
        }
    }
}

impl DataPort for MockDataPort {
    fn fetch_bars(&mut self, request: &HistoricalBarsRequest) -> Result<Vec<Bar>, OrbError> {
        self.requests.push(request.clone());
        let request_id = self.requests.len() as i32;
        match &self.reply {
            Reply::Bars(bars) if !bars.is_empty() => Ok(bars.clone()),
            Reply::Bars(_) | Reply::Empty => Err(OrbError::EmptyResult { request_id }),
            Reply::Timeout => Err(OrbError::Timeout {
                request_id,
                waited: Duration::from_secs(10),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Callback {
    Bar(Bar),
    Update(Bar),
    End,
    Error(String),
}

/// What the scripted connection saw, shared with the test thread.
#[derive(Debug, Default)]
pub struct ConnectionLog {
    pub connected: bool,
    pub disconnected: bool,
    pub requests: Vec<(RequestId, HistoricalBarsRequest)>,
}

/// `BrokerConnection` that answers each request with a fixed callback script.
pub struct ScriptedConnection {
    pub script: Vec<Callback>,
    pub refuse_connect: bool,
    pub connect_delay: Duration,
    /// Callbacks delivered on the next pump even without a request.
    pub unsolicited: Vec<(RequestId, Callback)>,
    pub log: Arc<Mutex<ConnectionLog>>,
    queue: VecDeque<(RequestId, Callback)>,
}

impl ScriptedConnection {
    pub fn new(script: Vec<Callback>) -> Self {
        Self {
            script,
            refuse_connect: false,
            connect_delay: Duration::ZERO,
            unsolicited: Vec::new(),
            log: Arc::new(Mutex::new(ConnectionLog::default())),
            queue: VecDeque::new(),
        }
    }

    /// Bars followed by the stream end.
    pub fn serving(bars: &[Bar]) -> Self {
        let mut script: Vec<Callback> = bars.iter().copied().map(Callback::Bar).collect();
        script.push(Callback::End);
        Self::new(script)
    }
}

impl BrokerConnection for ScriptedConnection {
    fn connect(&mut self, _params: &ConnectionParams) -> Result<(), OrbError> {
        thread::sleep(self.connect_delay);
        if self.refuse_connect {
            return Err(OrbError::Connection {
                reason: "connection refused".to_string(),
            });
        }
        self.log.lock().unwrap().connected = true;
        Ok(())
    }

    fn request_historical_bars(
        &mut self,
        request_id: RequestId,
        request: &HistoricalBarsRequest,
    ) -> Result<(), OrbError> {
        self.log
            .lock()
            .unwrap()
            .requests
            .push((request_id, request.clone()));
        self.queue
            .extend(self.script.iter().cloned().map(|c| (request_id, c)));
        Ok(())
    }

    fn pump(&mut self, sink: &mut dyn BarSink, wait: Duration) -> Result<(), OrbError> {
        self.queue.extend(self.unsolicited.drain(..));
        if self.queue.is_empty() {
            thread::sleep(wait);
            return Ok(());
        }
        while let Some((id, callback)) = self.queue.pop_front() {
            match callback {
                Callback::Bar(bar) => sink.on_bar(id, bar),
                Callback::Update(bar) => sink.on_bar_update(id, bar),
                Callback::End => sink.on_stream_end(id, at(9, 30), at(16, 0)),
                Callback::Error(reason) => sink.on_request_error(id, &reason),
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.log.lock().unwrap().disconnected = true;
    }
}

pub fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

pub fn make_bar(h: u32, m: u32, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        timestamp: at(h, m),
        open,
        high,
        low,
        close,
        volume: 1_000.0,
    }
}

pub fn flat_bar(timestamp: NaiveDateTime, price: f64) -> Bar {
    Bar {
        timestamp,
        open: price,
        high: price,
        low: price,
        close: price,
        volume: 1_000.0,
    }
}

/// Range [100, 101] at 09:30, breakout close 102 at 09:31, hammer doji
/// retracement at 100.5 on 09:32 (the entry bar).
pub fn entry_sequence() -> Vec<Bar> {
    vec![
        make_bar(9, 30, 100.5, 101.0, 100.0, 100.8),
        make_bar(9, 31, 101.0, 102.2, 100.9, 102.0),
        make_bar(9, 32, 100.5, 100.8, 100.5, 100.5),
    ]
}

/// `entry_sequence` followed by flat bars at `price` up to `count` bars in total.
pub fn session_after_entry(price: f64, count: usize) -> Vec<Bar> {
    let mut bars = entry_sequence();
    let mut t = at(9, 33);
    while bars.len() < count {
        bars.push(flat_bar(t, price));
        t += TimeDelta::minutes(1);
    }
    bars
}

pub const CSV_HEADER: &str = "timestamp,open,high,low,close,volume\n";

pub fn bars_to_csv(bars: &[Bar]) -> String {
    let mut out = String::from(CSV_HEADER);
    for b in bars {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            b.timestamp.format("%Y%m%d %H:%M:%S"),
            b.open,
            b.high,
            b.low,
            b.close,
            b.volume
        ));
    }
    out
}
