//! CLI definition and dispatch.

use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;

use crate::adapters::csv_adapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::market_data_bridge::{BridgeConfig, MarketDataBridge};
use crate::adapters::replay_connection::ReplayConnection;
use crate::domain::backtest::{self as backtest_engine, BacktestConfig, BacktestResult};
use crate::domain::bar::Bar;
use crate::domain::config_validation::{
    bool_setting, float_setting, int_setting, parse_time, stop_setting, validate_backtest_config,
    validate_connection_config, validate_request_config, validate_strategy_config,
};
use crate::domain::data_feed::DataFeed;
use crate::domain::error::OrbError;
use crate::domain::metrics::Metrics;
use crate::domain::params::StrategyParams;
use crate::domain::request::{
    BarSize, ConnectionParams, Contract, HistoricalBarsRequest, HistoryDuration, parse_timestamp,
};
use crate::domain::strategy::{OpeningRangeStrategy, Strategy};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;

#[derive(Parser, Debug)]
#[command(name = "orbtrader", about = "Opening-range breakout backtester")]
pub struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch one session of bars and run the strategy over it
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        replay_file: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Fetch bars and write them to a CSV file
    Fetch {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        replay_file: Option<PathBuf>,
    },
}

/// Values given on the command line that take precedence over the INI file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub symbol: Option<String>,
    pub replay_file: Option<PathBuf>,
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Backtest {
            config,
            symbol,
            replay_file,
        } => run_backtest(
            &config,
            &Overrides {
                symbol,
                replay_file,
            },
        ),
        Command::Validate { config } => run_validate(&config),
        Command::Fetch {
            config,
            output,
            symbol,
            replay_file,
        } => run_fetch(
            &config,
            &output,
            &Overrides {
                symbol,
                replay_file,
            },
        ),
    }
}

fn fail(err: &OrbError) -> ExitCode {
    eprintln!("error: {err}");
    err.into()
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| fail(&e))
}

pub fn validate_all(config: &dyn ConfigPort) -> Result<(), OrbError> {
    validate_connection_config(config)?;
    validate_request_config(config)?;
    validate_backtest_config(config)?;
    validate_strategy_config(config)?;
    Ok(())
}

fn run_backtest(config_path: &Path, overrides: &Overrides) -> ExitCode {
    // Stage 1: Load and validate config
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    if let Err(e) = validate_all(&adapter) {
        return fail(&e);
    }

    // Stage 2: Build everything before connecting
    let params = match build_strategy_params(&adapter) {
        Ok(p) => p,
        Err(e) => return fail(&e),
    };
    let request = match build_request(&adapter, overrides.symbol.as_deref()) {
        Ok(r) => r,
        Err(e) => return fail(&e),
    };
    let bt_config = match build_backtest_config(&adapter) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };

    // Stage 3: Start the bridge
    let mut bridge = match start_bridge(&adapter, overrides) {
        Ok(b) => b,
        Err(e) => return fail(&e),
    };

    // Stage 4: Fetch, replay, summarise
    let outcome = run_backtest_pipeline(&mut bridge, &request, &params, &bt_config);
    bridge.stop();

    match outcome {
        Ok(result) => {
            print_summary(&request, &result);
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

/// Fetch the request's bars through `data_port` and replay them through a
/// fresh opening-range strategy.
pub fn run_backtest_pipeline(
    data_port: &mut dyn DataPort,
    request: &HistoricalBarsRequest,
    params: &StrategyParams,
    bt_config: &BacktestConfig,
) -> Result<BacktestResult, OrbError> {
    let bars = data_port.fetch_bars(request)?;
    eprintln!("Received {} bars for {}", bars.len(), request.contract.symbol);

    let feed = DataFeed::checked(bars)?;
    let mut strategy = OpeningRangeStrategy::new(params.clone())?;
    let result = backtest_engine::run_backtest(&feed, &mut strategy, bt_config);
    info!(
        strategy = strategy.name(),
        phase = ?strategy.state().phase(),
        bars = result.bars_processed,
        "backtest finished"
    );
    Ok(result)
}

fn print_summary(request: &HistoricalBarsRequest, result: &BacktestResult) {
    eprintln!("{}", format_summary(request, result));
}

/// The run report printed after a backtest.
pub fn format_summary(request: &HistoricalBarsRequest, result: &BacktestResult) -> String {
    let metrics = Metrics::compute(&result.portfolio);

    let mut lines = vec![
        format!("\n=== Results: {} ===", request.contract),
        format!("Bars Processed:   {}", result.bars_processed),
        format!("Final Equity:     {:.2}", metrics.final_equity),
        format!("Total Return:     {:.4}%", metrics.total_return * 100.0),
        format!(
            "Max Drawdown:     -{:.4}% ({} bars)",
            metrics.max_drawdown * 100.0,
            metrics.max_drawdown_bars
        ),
        format!(
            "Total Trades:     {} ({} won, {} lost)",
            metrics.total_trades, metrics.trades_won, metrics.trades_lost
        ),
        format!("Win Rate:         {:.1}%", metrics.win_rate * 100.0),
        format!("Profit Factor:    {:.2}", metrics.profit_factor),
        format!("Largest Win:      {:.2}", metrics.largest_win),
        format!("Largest Loss:     {:.2}", metrics.largest_loss),
        format!("Avg Trade Length: {:.1} min", metrics.avg_trade_minutes),
    ];

    if !result.portfolio.closed_trades.is_empty() {
        lines.push("\n=== Trades ===".to_string());
        for trade in &result.portfolio.closed_trades {
            let pnl_sign = if trade.pnl >= 0.0 { "+" } else { "" };
            lines.push(format!(
                "  {} -> {}  {} @ {:.2} -> {:.2}  {}{:.2}  ({})",
                trade.entry_time.format("%H:%M"),
                trade.exit_time.format("%H:%M"),
                trade.quantity,
                trade.entry_price,
                trade.exit_price,
                pnl_sign,
                trade.pnl,
                trade.reason,
            ));
        }
    }
    if result.rejected_actions > 0 {
        lines.push(format!(
            "\n{} action(s) could not be executed",
            result.rejected_actions
        ));
    }
    lines.join("\n")
}

fn run_validate(config_path: &Path) -> ExitCode {
    eprintln!("Validating config: {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    if let Err(e) = validate_all(&adapter) {
        return fail(&e);
    }

    let params = match build_strategy_params(&adapter) {
        Ok(p) => p,
        Err(e) => return fail(&e),
    };
    let request = match build_request(&adapter, None) {
        Ok(r) => r,
        Err(e) => return fail(&e),
    };

    eprintln!("\nStrategy:");
    eprintln!("  target:       {}", params.target);
    eprintln!("  stop:         {}", params.stop);
    eprintln!("  check_time:   {}", params.check_time);
    eprintln!("  entry_time:   {} bars", params.entry_time);
    eprintln!("  window:       {} - {}", params.window_start, params.window_end);
    eprintln!("  scale_out:    {} (reserved)", params.scale_out);

    eprintln!("\nRequest:");
    eprintln!("  contract:     {}", request.contract);
    eprintln!(
        "  end_time:     {}",
        request
            .end_time
            .map_or_else(|| "now".to_string(), |t| t.to_string())
    );
    eprintln!("  duration:     {}", request.duration);
    eprintln!("  bar_size:     {}", request.bar_size);
    eprintln!("  what_to_show: {}", request.what_to_show);
    eprintln!("  use_rth:      {}", request.use_rth);

    eprintln!("\nConfiguration is valid.");
    ExitCode::SUCCESS
}

fn run_fetch(config_path: &Path, output: &Path, overrides: &Overrides) -> ExitCode {
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    if let Err(e) = validate_connection_config(&adapter).and_then(|()| validate_request_config(&adapter)) {
        return fail(&e);
    }
    let request = match build_request(&adapter, overrides.symbol.as_deref()) {
        Ok(r) => r,
        Err(e) => return fail(&e),
    };

    let mut bridge = match start_bridge(&adapter, overrides) {
        Ok(b) => b,
        Err(e) => return fail(&e),
    };
    let fetched: Result<Vec<Bar>, OrbError> = bridge.fetch_bars(&request);
    bridge.stop();

    let written = fetched.and_then(|bars| {
        csv_adapter::write_bars(output, &bars)?;
        Ok(bars.len())
    });
    match written {
        Ok(count) => {
            eprintln!("Wrote {count} bars to {}", output.display());
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn start_bridge(
    adapter: &dyn ConfigPort,
    overrides: &Overrides,
) -> Result<MarketDataBridge<ReplayConnection>, OrbError> {
    let connection = build_replay_connection(adapter, overrides.replay_file.as_deref())?;
    let mut bridge = MarketDataBridge::new(connection, build_bridge_config(adapter)?);
    bridge.start(&build_connection_params(adapter)?)?;
    Ok(bridge)
}

pub fn build_connection_params(adapter: &dyn ConfigPort) -> Result<ConnectionParams, OrbError> {
    let defaults = ConnectionParams::default();
    let port = int_setting(adapter, "connection", "port", i64::from(defaults.port))?;
    let client_id = int_setting(adapter, "connection", "client_id", i64::from(defaults.client_id))?;
    Ok(ConnectionParams {
        host: adapter.get_string_or("connection", "host", &defaults.host),
        port: u16::try_from(port)
            .map_err(|_| OrbError::invalid("connection", "port", "port must be between 1 and 65535"))?,
        client_id: i32::try_from(client_id).map_err(|_| {
            OrbError::invalid("connection", "client_id", "client_id does not fit in 32 bits")
        })?,
    })
}

pub fn build_bridge_config(adapter: &dyn ConfigPort) -> Result<BridgeConfig, OrbError> {
    let secs = |section: &str, key: &str, default: i64| -> Result<Duration, OrbError> {
        let value = int_setting(adapter, section, key, default)?;
        u64::try_from(value)
            .ok()
            .filter(|&v| v > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| OrbError::invalid(section, key, format!("{key} must be at least 1")))
    };
    Ok(BridgeConfig {
        connect_timeout: secs("connection", "connect_timeout_secs", 5)?,
        request_timeout: secs("request", "timeout_secs", 10)?,
        ..BridgeConfig::default()
    })
}

pub fn build_replay_connection(
    adapter: &dyn ConfigPort,
    replay_override: Option<&Path>,
) -> Result<ReplayConnection, OrbError> {
    let path = match replay_override {
        Some(p) => p.to_path_buf(),
        None => adapter
            .get_string("connection", "replay_file")
            .filter(|s| !s.trim().is_empty())
            .map(|s| PathBuf::from(s.trim()))
            .ok_or_else(|| OrbError::ConfigMissing {
                section: "connection".into(),
                key: "replay_file".into(),
            })?,
    };
    let latency_ms = int_setting(adapter, "connection", "replay_latency_ms", 0)?;
    let latency_ms = u64::try_from(latency_ms).map_err(|_| {
        OrbError::invalid(
            "connection",
            "replay_latency_ms",
            "replay_latency_ms must be non-negative",
        )
    })?;
    Ok(ReplayConnection::new(path).with_latency(Duration::from_millis(latency_ms)))
}

pub fn build_request(
    adapter: &dyn ConfigPort,
    symbol_override: Option<&str>,
) -> Result<HistoricalBarsRequest, OrbError> {
    let symbol = match symbol_override {
        Some(s) => s.trim().to_uppercase(),
        None => adapter.get_string_or("request", "symbol", "SPY").to_uppercase(),
    };
    if symbol.is_empty() {
        return Err(OrbError::ConfigMissing {
            section: "request".into(),
            key: "symbol".into(),
        });
    }

    let contract = Contract {
        symbol,
        sec_type: adapter.get_string_or("request", "sec_type", "STK"),
        exchange: adapter.get_string_or("request", "exchange", "SMART"),
        currency: adapter.get_string_or("request", "currency", "USD"),
    };

    let end_time = match adapter
        .get_string("request", "end_time")
        .filter(|s| !s.trim().is_empty())
    {
        Some(s) => Some(
            parse_timestamp(&s)
                .map_err(|e| OrbError::invalid("request", "end_time", e.to_string()))?,
        ),
        None => None,
    };

    let duration: HistoryDuration = adapter
        .get_string_or("request", "duration", "1 D")
        .parse()
        .map_err(|reason| OrbError::invalid("request", "duration", reason))?;
    let bar_size: BarSize = adapter
        .get_string_or("request", "bar_size", "1 min")
        .parse()
        .map_err(|reason| OrbError::invalid("request", "bar_size", reason))?;

    Ok(HistoricalBarsRequest {
        contract,
        end_time,
        duration,
        bar_size,
        what_to_show: adapter
            .get_string_or("request", "what_to_show", "TRADES")
            .to_uppercase(),
        use_rth: bool_setting(adapter, "request", "use_rth", true)?,
        keep_up_to_date: bool_setting(adapter, "request", "keep_up_to_date", false)?,
    })
}

pub fn build_strategy_params(adapter: &dyn ConfigPort) -> Result<StrategyParams, OrbError> {
    let defaults = StrategyParams::default();
    let params = StrategyParams {
        target: float_setting(adapter, "strategy", "target", defaults.target)?,
        stop: stop_setting(adapter)?.1,
        check_time: parse_time(adapter, "check_time", "09:30")?,
        entry_time: int_setting(adapter, "strategy", "entry_time", defaults.entry_time)?,
        scale_out: float_setting(adapter, "strategy", "scale_out", defaults.scale_out)?,
        window_start: parse_time(adapter, "window_start", "09:30")?,
        window_end: parse_time(adapter, "window_end", "11:00")?,
    };
    params.validate()?;
    Ok(params)
}

pub fn build_backtest_config(adapter: &dyn ConfigPort) -> Result<BacktestConfig, OrbError> {
    let defaults = BacktestConfig::default();
    Ok(BacktestConfig {
        initial_capital: float_setting(adapter, "backtest", "initial_capital", defaults.initial_capital)?,
        commission_pct: float_setting(adapter, "backtest", "commission_pct", defaults.commission_pct)?,
        stake: int_setting(adapter, "backtest", "stake", defaults.stake)?,
    })
}
