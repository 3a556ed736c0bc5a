//! Backtest runner: replays a data feed through a strategy and executes its actions.
//!
//! Orders are fixed-stake market orders filled at the close of the bar the
//! action was issued on, with a percentage commission on each side.

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use super::bar::Bar;
use super::data_feed::DataFeed;
use super::position::{ClosedTrade, ExitReason};
use super::strategy::{Action, Strategy};

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    /// Percent of traded value, charged on entry and on exit.
    pub commission_pct: f64,
    /// Shares per order.
    pub stake: i64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            initial_capital: 100_000.0,
            commission_pct: 0.1,
            stake: 1,
        }
    }
}

/// Calculate commission: trade_value * pct / 100.
pub fn calculate_commission(trade_value: f64, config: &BacktestConfig) -> f64 {
    trade_value * config.commission_pct / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub quantity: i64,
    pub entry_price: f64,
    pub entry_time: NaiveDateTime,
    pub entry_commission: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquityPoint {
    pub timestamp: NaiveDateTime,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Portfolio {
    pub cash: f64,
    pub initial_capital: f64,
    pub holding: Option<Holding>,
    pub closed_trades: Vec<ClosedTrade>,
    pub equity_curve: Vec<EquityPoint>,
}

impl Portfolio {
    pub fn new(initial_capital: f64) -> Self {
        Portfolio {
            cash: initial_capital,
            initial_capital,
            holding: None,
            closed_trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    pub fn total_equity(&self, price: f64) -> f64 {
        let position_value = self
            .holding
            .as_ref()
            .map_or(0.0, |h| h.quantity as f64 * price);
        self.cash + position_value
    }

    pub fn record_equity(&mut self, timestamp: NaiveDateTime, equity: f64) {
        self.equity_curve.push(EquityPoint { timestamp, equity });
    }

    pub fn final_equity(&self) -> f64 {
        self.equity_curve
            .last()
            .map_or(self.initial_capital, |p| p.equity)
    }
}

/// Result of a buy order.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryResult {
    Entered {
        quantity: i64,
        execution_price: f64,
        commission: f64,
    },
    AlreadyInPosition,
    InsufficientCapital,
}

/// Buy `config.stake` shares at the bar close.
pub fn enter_long(portfolio: &mut Portfolio, bar: &Bar, config: &BacktestConfig) -> EntryResult {
    if portfolio.holding.is_some() {
        return EntryResult::AlreadyInPosition;
    }

    let quantity = config.stake;
    let execution_price = bar.close;
    let cost = quantity as f64 * execution_price;
    let commission = calculate_commission(cost, config);

    if cost + commission > portfolio.cash {
        return EntryResult::InsufficientCapital;
    }

    portfolio.cash -= cost + commission;
    portfolio.holding = Some(Holding {
        quantity,
        entry_price: execution_price,
        entry_time: bar.timestamp,
        entry_commission: commission,
    });

    EntryResult::Entered {
        quantity,
        execution_price,
        commission,
    }
}

/// Sell the whole holding at the bar close. `None` when flat.
pub fn exit_position(
    portfolio: &mut Portfolio,
    bar: &Bar,
    reason: ExitReason,
    config: &BacktestConfig,
) -> Option<ClosedTrade> {
    let holding = portfolio.holding.take()?;

    let exit_price = bar.close;
    let exit_value = holding.quantity as f64 * exit_price;
    let exit_commission = calculate_commission(exit_value, config);
    let pnl = holding.quantity as f64 * (exit_price - holding.entry_price)
        - holding.entry_commission
        - exit_commission;

    portfolio.cash += exit_value - exit_commission;

    let trade = ClosedTrade {
        quantity: holding.quantity,
        entry_price: holding.entry_price,
        exit_price,
        entry_time: holding.entry_time,
        exit_time: bar.timestamp,
        pnl,
        reason,
    };
    portfolio.closed_trades.push(trade.clone());
    Some(trade)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestResult {
    pub portfolio: Portfolio,
    pub bars_processed: usize,
    /// Actions that could not be executed (already long, flat, or no cash).
    pub rejected_actions: usize,
}

/// Drive `strategy.on_bar` over every bar of `feed` in order, then `on_stop`
/// on the final bar.
pub fn run_backtest(
    feed: &DataFeed,
    strategy: &mut dyn Strategy,
    config: &BacktestConfig,
) -> BacktestResult {
    let mut portfolio = Portfolio::new(config.initial_capital);
    let mut rejected_actions = 0usize;

    info!(
        strategy = strategy.name(),
        bars = feed.len(),
        sessions = feed.sessions(),
        "running backtest"
    );

    for bar in feed {
        if let Some(action) = strategy.on_bar(bar) {
            if !execute(&mut portfolio, bar, action, config) {
                rejected_actions += 1;
            }
        }
        let equity = portfolio.total_equity(bar.close);
        portfolio.record_equity(bar.timestamp, equity);
    }

    if let Some(last) = feed.last() {
        if let Some(action) = strategy.on_stop(last) {
            if !execute(&mut portfolio, last, action, config) {
                rejected_actions += 1;
            }
            let equity = portfolio.total_equity(last.close);
            if let Some(point) = portfolio.equity_curve.last_mut() {
                point.equity = equity;
            }
        }
    }

    BacktestResult {
        portfolio,
        bars_processed: feed.len(),
        rejected_actions,
    }
}

fn execute(portfolio: &mut Portfolio, bar: &Bar, action: Action, config: &BacktestConfig) -> bool {
    match action {
        Action::Buy => match enter_long(portfolio, bar, config) {
            EntryResult::Entered {
                quantity,
                execution_price,
                commission,
            } => {
                debug!(quantity, execution_price, commission, "buy filled");
                true
            }
            other => {
                warn!(timestamp = %bar.timestamp, result = ?other, "buy rejected");
                false
            }
        },
        Action::Close(reason) => match exit_position(portfolio, bar, reason, config) {
            Some(trade) => {
                debug!(pnl = trade.pnl, %reason, "close filled");
                true
            }
            None => {
                warn!(timestamp = %bar.timestamp, "close requested while flat");
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(m: u32, close: f64) -> Bar {
        Bar {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(10, m, 0)
                .unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    /// Buys on the first bar, closes on the third.
    struct Scripted {
        bars: usize,
    }

    impl Strategy for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn on_bar(&mut self, _bar: &Bar) -> Option<Action> {
            self.bars += 1;
            match self.bars {
                1 => Some(Action::Buy),
                2 => Some(Action::Buy),
                3 => Some(Action::Close(ExitReason::TakeProfit)),
                4 => Some(Action::Close(ExitReason::TakeProfit)),
                _ => None,
            }
        }

        fn on_stop(&mut self, _last: &Bar) -> Option<Action> {
            None
        }
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            initial_capital: 1_000.0,
            commission_pct: 0.0,
            stake: 2,
        }
    }

    #[test]
    fn commission_is_percent_of_value() {
        let cfg = BacktestConfig::default();
        assert!((calculate_commission(10_000.0, &cfg) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn enter_and_exit_long() {
        let cfg = BacktestConfig {
            commission_pct: 1.0,
            ..config()
        };
        let mut p = Portfolio::new(1_000.0);

        let entry = enter_long(&mut p, &bar(0, 100.0), &cfg);
        assert_eq!(
            entry,
            EntryResult::Entered {
                quantity: 2,
                execution_price: 100.0,
                commission: 2.0
            }
        );
        assert!((p.cash - 798.0).abs() < 1e-9);

        let trade = exit_position(&mut p, &bar(5, 110.0), ExitReason::TimeExit, &cfg).unwrap();
        // 2 * 10 - 2.0 - 2.2
        assert!((trade.pnl - 15.8).abs() < 1e-9);
        assert!((p.cash - (798.0 + 220.0 - 2.2)).abs() < 1e-9);
        assert!(p.holding.is_none());
        assert_eq!(p.closed_trades.len(), 1);
        assert_eq!(p.closed_trades[0].reason, ExitReason::TimeExit);
    }

    #[test]
    fn insufficient_capital_rejected() {
        let mut p = Portfolio::new(100.0);
        let result = enter_long(&mut p, &bar(0, 100.0), &config());
        assert_eq!(result, EntryResult::InsufficientCapital);
        assert!(p.holding.is_none());
        assert!((p.cash - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exit_when_flat_is_none() {
        let mut p = Portfolio::new(100.0);
        assert!(exit_position(&mut p, &bar(0, 1.0), ExitReason::StopLoss, &config()).is_none());
    }

    #[test]
    fn runner_executes_and_rejects_actions() {
        let feed = DataFeed::new(vec![
            bar(0, 100.0),
            bar(1, 101.0),
            bar(2, 103.0),
            bar(3, 104.0),
        ]);
        let mut strategy = Scripted { bars: 0 };
        let result = run_backtest(&feed, &mut strategy, &config());

        assert_eq!(result.bars_processed, 4);
        assert_eq!(result.rejected_actions, 2);
        assert_eq!(result.portfolio.closed_trades.len(), 1);
        assert!((result.portfolio.closed_trades[0].pnl - 6.0).abs() < 1e-9);
        assert_eq!(result.portfolio.equity_curve.len(), 4);
        assert!((result.portfolio.equity_curve[1].equity - 1_002.0).abs() < 1e-9);
        assert!((result.portfolio.final_equity() - 1_006.0).abs() < 1e-9);
    }

    #[test]
    fn empty_feed_produces_empty_result() {
        let mut strategy = Scripted { bars: 0 };
        let result = run_backtest(&DataFeed::default(), &mut strategy, &config());
        assert_eq!(result.bars_processed, 0);
        assert!(result.portfolio.equity_curve.is_empty());
        assert!((result.portfolio.final_equity() - 1_000.0).abs() < f64::EPSILON);
    }
}
