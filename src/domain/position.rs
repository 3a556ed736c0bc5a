//! Open position and closed trade records.

use chrono::NaiveDateTime;
use std::fmt;

/// The strategy's view of its single long position.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_profit_price: f64,
    pub entry_bar_index: usize,
}

impl Position {
    pub fn should_stop_loss(&self, price: f64) -> bool {
        price <= self.stop_price
    }

    pub fn should_take_profit(&self, price: f64) -> bool {
        price >= self.take_profit_price
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TimeExit,
    EndOfRun,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop-loss",
            ExitReason::TakeProfit => "take-profit",
            ExitReason::TimeExit => "time-exit",
            ExitReason::EndOfRun => "end-of-run",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub quantity: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: NaiveDateTime,
    pub exit_time: NaiveDateTime,
    pub pnl: f64,
    pub reason: ExitReason,
}
