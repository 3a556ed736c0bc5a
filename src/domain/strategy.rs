//! Strategy trait and the opening-range breakout state machine.
//!
//! Per bar, in order: count the bar; manage an open position (time exit,
//! then stop-loss, then take-profit); set the opening range from the first
//! bar at or after `check_time`; inside the breakout window, arm on a close
//! at or above `high + width`; once armed, enter long on a retracement into
//! the range that prints a hammer. A run takes at most one position and
//! ends in `Phase::Closed` once that position is closed.

use tracing::{debug, info};

use super::bar::Bar;
use super::error::OrbError;
use super::opening_range::OpeningRange;
use super::params::StrategyParams;
use super::position::{ExitReason, Position};

/// Order the strategy hands to the backtest runner for the current bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Buy,
    Close(ExitReason),
}

pub trait Strategy {
    fn name(&self) -> &str;

    fn on_bar(&mut self, bar: &Bar) -> Option<Action>;

    /// Called once after the final bar of the stream.
    fn on_stop(&mut self, last: &Bar) -> Option<Action>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingRange,
    RangeSet,
    BreakoutArmed,
    PositionOpen,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyRunState {
    pub opening_range: Option<OpeningRange>,
    pub breakout_armed: bool,
    pub position: Option<Position>,
    pub bars_seen: usize,
    closed: bool,
}

impl StrategyRunState {
    pub fn phase(&self) -> Phase {
        if self.closed {
            Phase::Closed
        } else if self.position.is_some() {
            Phase::PositionOpen
        } else if self.breakout_armed {
            Phase::BreakoutArmed
        } else if self.opening_range.is_some() {
            Phase::RangeSet
        } else {
            Phase::AwaitingRange
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpeningRangeStrategy {
    params: StrategyParams,
    state: StrategyRunState,
}

impl OpeningRangeStrategy {
    pub fn new(params: StrategyParams) -> Result<Self, OrbError> {
        params.validate()?;
        Ok(OpeningRangeStrategy {
            params,
            state: StrategyRunState::default(),
        })
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    pub fn state(&self) -> &StrategyRunState {
        &self.state
    }

    fn manage_position(&mut self, bar: &Bar) -> Option<Action> {
        let position = self.state.position.as_ref()?;
        let reason = if self.state.bars_seen >= self.params.exit_after_bars() {
            ExitReason::TimeExit
        } else if position.should_stop_loss(bar.close) {
            ExitReason::StopLoss
        } else if position.should_take_profit(bar.close) {
            ExitReason::TakeProfit
        } else {
            return None;
        };
        Some(self.close_position(bar, reason))
    }

    fn close_position(&mut self, bar: &Bar, reason: ExitReason) -> Action {
        self.state.position = None;
        self.state.breakout_armed = false;
        self.state.closed = true;
        info!(timestamp = %bar.timestamp, close = bar.close, %reason, "position closed");
        Action::Close(reason)
    }

    fn open_position(&mut self, bar: &Bar, range: OpeningRange) -> Action {
        let width = range.width();
        let position = Position {
            entry_price: bar.close,
            stop_price: bar.close - self.params.stop * width,
            take_profit_price: bar.close + self.params.target * width,
            entry_bar_index: self.state.bars_seen - 1,
        };
        info!(
            timestamp = %bar.timestamp,
            entry = position.entry_price,
            stop = position.stop_price,
            target = position.take_profit_price,
            "hammer retracement, entering long"
        );
        self.state.position = Some(position);
        self.state.breakout_armed = false;
        Action::Buy
    }
}

impl Strategy for OpeningRangeStrategy {
    fn name(&self) -> &str {
        "Opening Range Breakout"
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<Action> {
        self.state.bars_seen += 1;

        if self.state.closed {
            return None;
        }
        if self.state.position.is_some() {
            return self.manage_position(bar);
        }

        let time = bar.time();
        if self.state.opening_range.is_none() && time >= self.params.check_time {
            let range = OpeningRange::from_bar(bar);
            info!(
                timestamp = %bar.timestamp,
                high = range.high,
                low = range.low,
                "opening range set"
            );
            self.state.opening_range = Some(range);
        }

        let range = self.state.opening_range?;
        if !self.params.in_window(time) {
            return None;
        }

        if !self.state.breakout_armed {
            if range.is_breakout(bar.close) {
                info!(timestamp = %bar.timestamp, close = bar.close, "breakout armed");
                self.state.breakout_armed = true;
            }
            return None;
        }

        if self.state.bars_seen >= self.params.exit_after_bars() {
            return None;
        }
        if range.is_retracement(bar.close) {
            if bar.is_hammer() {
                return Some(self.open_position(bar, range));
            }
            debug!(timestamp = %bar.timestamp, "retracement without hammer");
        }
        None
    }

    fn on_stop(&mut self, last: &Bar) -> Option<Action> {
        if self.state.position.is_some() {
            return Some(self.close_position(last, ExitReason::EndOfRun));
        }
        None
    }
}
