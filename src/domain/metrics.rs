//! Run summary statistics.

use super::backtest::{EquityPoint, Portfolio};

#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub final_equity: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    /// Longest run of bars spent below a prior equity peak.
    pub max_drawdown_bars: usize,
    pub total_trades: usize,
    pub trades_won: usize,
    pub trades_lost: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_trade_minutes: f64,
}

impl Metrics {
    pub fn compute(portfolio: &Portfolio) -> Self {
        let trades = &portfolio.closed_trades;
        let initial_capital = portfolio.initial_capital;
        let final_equity = portfolio.final_equity();

        let total_return = if initial_capital > 0.0 {
            (final_equity - initial_capital) / initial_capital
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_bars) = compute_drawdown(&portfolio.equity_curve);

        let mut trades_won = 0usize;
        let mut trades_lost = 0usize;
        let mut total_wins = 0.0_f64;
        let mut total_losses = 0.0_f64;
        let mut largest_win = 0.0_f64;
        let mut largest_loss = 0.0_f64;
        let mut total_minutes = 0i64;

        for trade in trades {
            let pnl = trade.pnl;
            if pnl > 0.0 {
                trades_won += 1;
                total_wins += pnl;
                largest_win = largest_win.max(pnl);
            } else if pnl < 0.0 {
                trades_lost += 1;
                total_losses += pnl.abs();
                largest_loss = largest_loss.max(pnl.abs());
            }
            total_minutes += (trade.exit_time - trade.entry_time).num_minutes();
        }

        let total_trades = trades.len();
        let win_rate = if total_trades > 0 {
            trades_won as f64 / total_trades as f64
        } else {
            0.0
        };

        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_trade_minutes = if total_trades > 0 {
            total_minutes as f64 / total_trades as f64
        } else {
            0.0
        };

        Metrics {
            final_equity,
            total_return,
            max_drawdown,
            max_drawdown_bars,
            total_trades,
            trades_won,
            trades_lost,
            win_rate,
            profit_factor,
            largest_win,
            largest_loss,
            avg_trade_minutes,
        }
    }
}

fn compute_drawdown(equity_curve: &[EquityPoint]) -> (f64, usize) {
    let Some(first) = equity_curve.first() else {
        return (0.0, 0);
    };

    let mut peak = first.equity;
    let mut max_dd = 0.0_f64;
    let mut max_dd_bars = 0usize;
    let mut current_dd_bars = 0usize;

    for point in equity_curve {
        if point.equity >= peak {
            peak = point.equity;
            current_dd_bars = 0;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - point.equity) / peak);
            current_dd_bars += 1;
            max_dd_bars = max_dd_bars.max(current_dd_bars);
        }
    }

    (max_dd, max_dd_bars)
}
