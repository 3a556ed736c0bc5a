//! Bridge from the callback-driven brokerage session to a blocking,
//! all-bars-at-once consumer.
//!
//! The connection lives on a dedicated worker thread together with a
//! [`BufferingSink`] that collects bars for the outstanding request. When the
//! stream-end callback fires, the sink moves the finished buffer through a
//! channel to the caller blocked in [`MarketDataBridge::await_completion`].
//! Nothing else crosses the thread boundary: commands go in over one channel,
//! completed buffers come out over another.

use chrono::NaiveDateTime;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::domain::bar::Bar;
use crate::domain::error::OrbError;
use crate::domain::request::{ConnectionParams, HistoricalBarsRequest};
use crate::ports::broker_port::{BarSink, BrokerConnection, RequestId};
use crate::ports::data_port::DataPort;

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Upper bound on `start` waiting for the session to come up.
    pub connect_timeout: Duration,
    /// Upper bound on a single `BrokerConnection::pump` call.
    pub poll_interval: Duration,
    /// Used by the `DataPort` implementation.
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(10),
        }
    }
}

enum Command {
    Request {
        request_id: RequestId,
        request: HistoricalBarsRequest,
    },
    Shutdown,
}

#[derive(Debug)]
enum Completion {
    Done {
        request_id: RequestId,
        bars: Vec<Bar>,
        range_start: NaiveDateTime,
        range_end: NaiveDateTime,
    },
    Failed {
        request_id: RequestId,
        error: OrbError,
    },
}

/// Callback sink owned by the worker thread.
struct BufferingSink {
    active: Option<RequestId>,
    buffer: Vec<Bar>,
    completions: Sender<Completion>,
    cancelled: Arc<AtomicBool>,
}

impl BufferingSink {
    fn accepts(&self, request_id: RequestId) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            debug!(request_id, "bridge stopped, dropping callback");
            return false;
        }
        if self.active != Some(request_id) {
            debug!(request_id, "no active request with this id, dropping callback");
            return false;
        }
        true
    }

    fn begin(&mut self, request_id: RequestId) {
        self.active = Some(request_id);
        self.buffer.clear();
    }

    fn fail(&mut self, request_id: RequestId, error: OrbError) {
        if self.active == Some(request_id) {
            self.active = None;
            self.buffer.clear();
        }
        let _ = self.completions.send(Completion::Failed { request_id, error });
    }

    /// A malformed bar fails the whole request rather than reaching the buffer.
    fn admit(&mut self, request_id: RequestId, bar: &Bar) -> bool {
        if !self.accepts(request_id) {
            return false;
        }
        match bar.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!(request_id, error = %e, "malformed bar from brokerage");
                self.fail(request_id, e);
                false
            }
        }
    }

    fn fail_active(&mut self, reason: &str) {
        if let Some(request_id) = self.active {
            self.fail(request_id, OrbError::connection(reason));
        }
    }
}

impl BarSink for BufferingSink {
    fn on_bar(&mut self, request_id: RequestId, bar: Bar) {
        if self.admit(request_id, &bar) {
            self.buffer.push(bar);
        }
    }

    fn on_bar_update(&mut self, request_id: RequestId, bar: Bar) {
        if !self.admit(request_id, &bar) {
            return;
        }
        match self.buffer.last_mut() {
            Some(last) if last.timestamp == bar.timestamp => *last = bar,
            _ => self.buffer.push(bar),
        }
    }

    fn on_stream_end(
        &mut self,
        request_id: RequestId,
        range_start: NaiveDateTime,
        range_end: NaiveDateTime,
    ) {
        if !self.accepts(request_id) {
            return;
        }
        self.active = None;
        let bars = mem::take(&mut self.buffer);
        info!(request_id, bars = bars.len(), %range_start, %range_end, "historical data end");
        let _ = self.completions.send(Completion::Done {
            request_id,
            bars,
            range_start,
            range_end,
        });
    }

    fn on_request_error(&mut self, request_id: RequestId, reason: &str) {
        if !self.accepts(request_id) {
            return;
        }
        warn!(request_id, reason, "request rejected by brokerage");
        self.fail(
            request_id,
            OrbError::Request {
                request_id,
                reason: reason.to_string(),
            },
        );
    }
}

struct Worker {
    commands: Sender<Command>,
    completions: Receiver<Completion>,
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct MarketDataBridge<C> {
    connection: Option<C>,
    config: BridgeConfig,
    worker: Option<Worker>,
    /// Worker left behind by a connect timeout, still blocked in `connect`.
    abandoned: Option<JoinHandle<()>>,
    next_request_id: RequestId,
    outstanding: Option<RequestId>,
}

impl<C: BrokerConnection + 'static> MarketDataBridge<C> {
    pub fn new(connection: C, config: BridgeConfig) -> Self {
        MarketDataBridge {
            connection: Some(connection),
            config,
            worker: None,
            abandoned: None,
            next_request_id: 1,
            outstanding: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Connect on a dedicated worker thread and return once the session is
    /// ready for requests.
    ///
    /// If `connect` outlasts `connect_timeout` the worker is cancelled and
    /// disconnects as soon as `connect` returns. Its handle is kept and joined
    /// by `stop` or drop once it has finished. A `connect` that never returns
    /// leaves the thread detached for the life of the process.
    pub fn start(&mut self, params: &ConnectionParams) -> Result<(), OrbError> {
        if self.worker.is_some() {
            return Err(OrbError::connection("bridge already started"));
        }
        let connection = self
            .connection
            .take()
            .ok_or_else(|| OrbError::connection("bridge cannot be restarted after stop"))?;

        let (ready_tx, ready_rx) = mpsc::channel();
        let (command_tx, command_rx) = mpsc::channel();
        let (completion_tx, completion_rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let sink = BufferingSink {
            active: None,
            buffer: Vec::new(),
            completions: completion_tx,
            cancelled: Arc::clone(&cancelled),
        };
        let params_owned = params.clone();
        let poll_interval = self.config.poll_interval;

        info!(%params, "connecting to brokerage");
        let handle = thread::Builder::new()
            .name("orb-market-data".into())
            .spawn(move || {
                run_worker(
                    connection,
                    params_owned,
                    ready_tx,
                    command_rx,
                    sink,
                    poll_interval,
                )
            })
            .map_err(|e| OrbError::connection(format!("failed to spawn worker: {e}")))?;

        match ready_rx.recv_timeout(self.config.connect_timeout) {
            Ok(Ok(())) => {
                info!(%params, "brokerage session ready");
                self.worker = Some(Worker {
                    commands: command_tx,
                    completions: completion_rx,
                    cancelled,
                    handle,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                cancelled.store(true, Ordering::Release);
                let _ = command_tx.send(Command::Shutdown);
                self.abandoned = Some(handle);
                Err(OrbError::connection(format!(
                    "no session confirmation from {params} within {:?}",
                    self.config.connect_timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(OrbError::connection("market data worker exited during connect"))
            }
        }
    }

    /// Issue one historical-bars request. Only one request may be outstanding.
    pub fn request_historical_bars(
        &mut self,
        request: &HistoricalBarsRequest,
    ) -> Result<RequestId, OrbError> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| OrbError::connection("bridge not started"))?;
        if let Some(request_id) = self.outstanding {
            return Err(OrbError::Request {
                request_id,
                reason: "previous request still outstanding".to_string(),
            });
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        info!(
            request_id,
            contract = %request.contract,
            duration = %request.duration,
            bar_size = %request.bar_size,
            use_rth = request.use_rth,
            "requesting historical bars"
        );
        worker
            .commands
            .send(Command::Request {
                request_id,
                request: request.clone(),
            })
            .map_err(|_| OrbError::connection("market data worker is gone"))?;
        self.outstanding = Some(request_id);
        Ok(request_id)
    }

    /// Block until the outstanding request's stream ends or `timeout` elapses.
    ///
    /// On timeout the request stays outstanding, so the caller may wait again.
    pub fn await_completion(&mut self, timeout: Duration) -> Result<Vec<Bar>, OrbError> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| OrbError::connection("bridge not started"))?;
        let request_id = self.outstanding.ok_or_else(|| OrbError::Request {
            request_id: 0,
            reason: "no outstanding request to wait for".to_string(),
        })?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match worker.completions.recv_timeout(remaining) {
                Ok(Completion::Done {
                    request_id: id,
                    bars,
                    range_start,
                    range_end,
                }) if id == request_id => {
                    self.outstanding = None;
                    if bars.is_empty() {
                        warn!(request_id, %range_start, %range_end, "stream ended with no bars");
                        return Err(OrbError::EmptyResult { request_id });
                    }
                    return Ok(bars);
                }
                Ok(Completion::Failed { request_id: id, error }) if id == request_id => {
                    self.outstanding = None;
                    return Err(error);
                }
                Ok(stale) => {
                    debug!(?stale, "discarding completion for another request");
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(request_id, ?timeout, "timed out waiting for historical data end");
                    return Err(OrbError::Timeout {
                        request_id,
                        waited: timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.outstanding = None;
                    return Err(OrbError::connection(
                        "market data worker exited before the stream ended",
                    ));
                }
            }
        }
    }

    /// Stop the worker and release the connection. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.connection = None;
        reap_abandoned(&mut self.abandoned);
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.cancelled.store(true, Ordering::Release);
        let _ = worker.commands.send(Command::Shutdown);
        if worker.handle.join().is_err() {
            error!("market data worker panicked");
        }
        self.outstanding = None;
        info!("market data bridge stopped");
    }
}

impl<C: BrokerConnection + 'static> DataPort for MarketDataBridge<C> {
    fn fetch_bars(&mut self, request: &HistoricalBarsRequest) -> Result<Vec<Bar>, OrbError> {
        self.request_historical_bars(request)?;
        self.await_completion(self.config.request_timeout)
    }
}

impl<C> Drop for MarketDataBridge<C> {
    fn drop(&mut self) {
        reap_abandoned(&mut self.abandoned);
        if let Some(worker) = self.worker.take() {
            worker.cancelled.store(true, Ordering::Release);
            let _ = worker.commands.send(Command::Shutdown);
            let _ = worker.handle.join();
        }
    }
}

fn reap_abandoned(abandoned: &mut Option<JoinHandle<()>>) {
    match abandoned.take() {
        Some(handle) if handle.is_finished() => {
            let _ = handle.join();
        }
        Some(handle) => {
            warn!("market data worker still blocked in connect, detaching");
            drop(handle);
        }
        None => {}
    }
}

fn run_worker<C: BrokerConnection>(
    mut connection: C,
    params: ConnectionParams,
    ready: Sender<Result<(), OrbError>>,
    commands: Receiver<Command>,
    mut sink: BufferingSink,
    poll_interval: Duration,
) {
    if let Err(e) = connection.connect(&params) {
        error!(%params, error = %e, "brokerage connection failed");
        let _ = ready.send(Err(e));
        return;
    }
    if sink.cancelled.load(Ordering::Acquire) || ready.send(Ok(())).is_err() {
        connection.disconnect();
        return;
    }

    'session: loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Request {
                    request_id,
                    request,
                }) => {
                    sink.begin(request_id);
                    if let Err(e) = connection.request_historical_bars(request_id, &request) {
                        sink.fail(request_id, e);
                    }
                }
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => break 'session,
                Err(TryRecvError::Empty) => break,
            }
        }

        if let Err(e) = connection.pump(&mut sink, poll_interval) {
            error!(error = %e, "brokerage session lost");
            sink.fail_active(&e.to_string());
            break;
        }
    }

    connection.disconnect();
    debug!("market data worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::Contract;
    use chrono::{NaiveDate, TimeDelta};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn ts(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
            + TimeDelta::minutes(i64::from(minute))
    }

    fn bar(minute: u32, close: f64) -> Bar {
        Bar {
            timestamp: ts(minute),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[derive(Clone)]
    enum Msg {
        Bar(Bar),
        Update(Bar),
        End,
        Error(&'static str),
    }

    /// Replies to each request with a fixed script of callbacks.
    struct Scripted {
        connect_ok: bool,
        connect_delay: Duration,
        script: Vec<Msg>,
        queue: VecDeque<(RequestId, Msg)>,
        disconnected: Arc<Mutex<bool>>,
    }

    impl Scripted {
        fn new(script: Vec<Msg>) -> Self {
            Scripted {
                connect_ok: true,
                connect_delay: Duration::ZERO,
                script,
                queue: VecDeque::new(),
                disconnected: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl BrokerConnection for Scripted {
        fn connect(&mut self, _params: &ConnectionParams) -> Result<(), OrbError> {
            thread::sleep(self.connect_delay);
            if self.connect_ok {
                Ok(())
            } else {
                Err(OrbError::connection("refused"))
            }
        }

        fn request_historical_bars(
            &mut self,
            request_id: RequestId,
            _request: &HistoricalBarsRequest,
        ) -> Result<(), OrbError> {
            self.queue
                .extend(self.script.iter().cloned().map(|m| (request_id, m)));
            Ok(())
        }

        fn pump(&mut self, sink: &mut dyn BarSink, wait: Duration) -> Result<(), OrbError> {
            if self.queue.is_empty() {
                thread::sleep(wait);
            }
            while let Some((id, msg)) = self.queue.pop_front() {
                match msg {
                    Msg::Bar(b) => sink.on_bar(id, b),
                    Msg::Update(b) => sink.on_bar_update(id, b),
                    Msg::End => sink.on_stream_end(id, ts(0), ts(59)),
                    Msg::Error(reason) => sink.on_request_error(id, reason),
                }
            }
            Ok(())
        }

        fn disconnect(&mut self) {
            *self.disconnected.lock().unwrap() = true;
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            connect_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
            request_timeout: Duration::from_secs(2),
        }
    }

    fn request() -> HistoricalBarsRequest {
        HistoricalBarsRequest::intraday(Contract::stock("SPY"))
    }

    #[test]
    fn delivers_bars_in_arrival_order() {
        let conn = Scripted::new(vec![
            Msg::Bar(bar(0, 1.0)),
            Msg::Bar(bar(1, 2.0)),
            Msg::Bar(bar(2, 3.0)),
            Msg::End,
        ]);
        let mut bridge = MarketDataBridge::new(conn, config());
        bridge.start(&ConnectionParams::default()).unwrap();
        bridge.request_historical_bars(&request()).unwrap();
        let bars = bridge.await_completion(Duration::from_secs(2)).unwrap();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![1.0, 2.0, 3.0]);
        bridge.stop();
    }

    #[test]
    fn update_with_same_timestamp_replaces_last_bar() {
        let conn = Scripted::new(vec![
            Msg::Bar(bar(0, 1.0)),
            Msg::Bar(bar(1, 2.0)),
            Msg::Update(bar(1, 2.5)),
            Msg::Update(bar(2, 3.0)),
            Msg::End,
        ]);
        let mut bridge = MarketDataBridge::new(conn, config());
        bridge.start(&ConnectionParams::default()).unwrap();
        let bars = bridge.fetch_bars(&request()).unwrap();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![1.0, 2.5, 3.0]);
    }

    #[test]
    fn empty_stream_is_empty_result_not_timeout() {
        let mut bridge = MarketDataBridge::new(Scripted::new(vec![Msg::End]), config());
        bridge.start(&ConnectionParams::default()).unwrap();
        bridge.request_historical_bars(&request()).unwrap();
        let err = bridge.await_completion(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, OrbError::EmptyResult { request_id: 1 }));
    }

    #[test]
    fn missing_stream_end_times_out() {
        let conn = Scripted::new(vec![Msg::Bar(bar(0, 1.0))]);
        let mut bridge = MarketDataBridge::new(conn, config());
        bridge.start(&ConnectionParams::default()).unwrap();
        bridge.request_historical_bars(&request()).unwrap();

        let started = Instant::now();
        let err = bridge
            .await_completion(Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, OrbError::Timeout { request_id: 1, .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn request_error_surfaces() {
        let conn = Scripted::new(vec![Msg::Error("no market data permissions")]);
        let mut bridge = MarketDataBridge::new(conn, config());
        bridge.start(&ConnectionParams::default()).unwrap();
        let err = bridge.fetch_bars(&request()).unwrap_err();
        assert!(
            matches!(err, OrbError::Request { request_id: 1, ref reason } if reason.contains("permissions"))
        );
    }

    #[test]
    fn refused_connection_fails_start() {
        let mut conn = Scripted::new(vec![]);
        conn.connect_ok = false;
        let mut bridge = MarketDataBridge::new(conn, config());
        let err = bridge.start(&ConnectionParams::default()).unwrap_err();
        assert!(matches!(err, OrbError::Connection { .. }));
        assert!(!bridge.is_running());
    }

    #[test]
    fn request_before_start_fails() {
        let mut bridge = MarketDataBridge::new(Scripted::new(vec![]), config());
        assert!(matches!(
            bridge.request_historical_bars(&request()),
            Err(OrbError::Connection { .. })
        ));
    }

    #[test]
    fn second_outstanding_request_is_rejected() {
        let mut bridge = MarketDataBridge::new(Scripted::new(vec![]), config());
        bridge.start(&ConnectionParams::default()).unwrap();
        bridge.request_historical_bars(&request()).unwrap();
        assert!(matches!(
            bridge.request_historical_bars(&request()),
            Err(OrbError::Request { request_id: 1, .. })
        ));
    }

    #[test]
    fn stop_is_idempotent_and_disconnects() {
        let conn = Scripted::new(vec![]);
        let disconnected = Arc::clone(&conn.disconnected);
        let mut bridge = MarketDataBridge::new(conn, config());
        bridge.start(&ConnectionParams::default()).unwrap();
        bridge.stop();
        bridge.stop();
        assert!(!bridge.is_running());
        assert!(*disconnected.lock().unwrap());
        assert!(bridge.start(&ConnectionParams::default()).is_err());
    }

    #[test]
    fn callbacks_after_cancel_are_dropped() {
        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut sink = BufferingSink {
            active: None,
            buffer: Vec::new(),
            completions: tx,
            cancelled: Arc::clone(&cancelled),
        };
        sink.begin(7);
        sink.on_bar(7, bar(0, 1.0));
        cancelled.store(true, Ordering::Release);
        sink.on_bar(7, bar(1, 2.0));
        sink.on_stream_end(7, ts(0), ts(1));
        assert_eq!(sink.buffer.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn callbacks_for_unknown_request_are_dropped() {
        let (tx, rx) = mpsc::channel();
        let mut sink = BufferingSink {
            active: None,
            buffer: Vec::new(),
            completions: tx,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        sink.begin(1);
        sink.on_bar(2, bar(0, 1.0));
        sink.on_stream_end(1, ts(0), ts(1));
        match rx.try_recv().unwrap() {
            Completion::Done { bars, .. } => assert!(bars.is_empty()),
            other => panic!("unexpected completion {other:?}"),
        }
        // Late update after the stream ended
        sink.on_bar_update(1, bar(1, 2.0));
        assert!(sink.buffer.is_empty());
    }

    #[test]
    fn malformed_bar_fails_the_request() {
        let mut inverted = bar(0, 100.5);
        inverted.high = 100.0;
        inverted.low = 101.0;
        let conn = Scripted::new(vec![
            Msg::Bar(inverted),
            Msg::Bar(bar(1, 99.5)),
            Msg::End,
        ]);
        let mut bridge = MarketDataBridge::new(conn, config());
        bridge.start(&ConnectionParams::default()).unwrap();
        let err = bridge.fetch_bars(&request()).unwrap_err();
        assert!(matches!(err, OrbError::Data { ref reason } if reason.contains("low above high")));

        // The failed request no longer blocks the next one.
        assert!(bridge.request_historical_bars(&request()).is_ok());
    }

    #[test]
    fn malformed_update_discards_buffer() {
        let (tx, rx) = mpsc::channel();
        let mut sink = BufferingSink {
            active: None,
            buffer: Vec::new(),
            completions: tx,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        sink.begin(3);
        sink.on_bar(3, bar(0, 1.0));
        let mut bad = bar(0, 1.0);
        bad.close = f64::NAN;
        sink.on_bar_update(3, bad);
        assert!(sink.buffer.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Completion::Failed { request_id: 3, error: OrbError::Data { .. } }
        ));
        sink.on_stream_end(3, ts(0), ts(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn worker_left_by_connect_timeout_is_reaped() {
        let mut conn = Scripted::new(vec![]);
        conn.connect_delay = Duration::from_millis(150);
        let disconnected = Arc::clone(&conn.disconnected);
        let mut bridge = MarketDataBridge::new(
            conn,
            BridgeConfig {
                connect_timeout: Duration::from_millis(20),
                ..config()
            },
        );
        assert!(matches!(
            bridge.start(&ConnectionParams::default()),
            Err(OrbError::Connection { .. })
        ));
        assert!(bridge.abandoned.is_some());

        thread::sleep(Duration::from_millis(400));
        assert!(*disconnected.lock().unwrap());
        bridge.stop();
        assert!(bridge.abandoned.is_none());
    }
}
