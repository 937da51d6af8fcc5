// ===============================
// src/main.rs
// ===============================
/*
 # run three symbols on the paper venue, events to ./data
 SYMBOLS=EURUSD,GBPUSD,USDJPY RECORD_FILE=data/events.jsonl cargo run --release

 # breaker / fleet state
 curl -s localhost:9898/metrics | egrep '^(breaker_|ledger_|worker_status)'
*/
/*
=============================================================================
Project : fleet_bot_rust - per-symbol autonomous trading fleet control plane
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Runs one decide-and-act worker per symbol, gates every trade
          through a shared drawdown circuit breaker, executes through a
          serialized broker session, supervises worker health, exposes
          Prometheus metrics, and records JSONL events.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::{
    select,
    time::{interval, timeout, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_bot_rust::broker::{bounded, Broker, SerializedBroker};
use fleet_bot_rust::config::{self, StrategyMode};
use fleet_bot_rust::domain::Event;
use fleet_bot_rust::execution::ExecutionPipeline;
use fleet_bot_rust::fleet::Fleet;
use fleet_bot_rust::gateway::{PaperBroker, PaperConfig};
use fleet_bot_rust::metrics;
use fleet_bot_rust::recorder::Recorder;
use fleet_bot_rust::risk::{utc_day_clock, RiskGate};
use fleet_bot_rust::signal::{NoTradeManagement, SignalGenerator, TimeBasedExit, TradeManagement};
use fleet_bot_rust::strategy::{MeanReversion, VolBreakout};
use fleet_bot_rust::supervisor::HeartbeatSupervisor;
use fleet_bot_rust::worker::WorkerDeps;

/// Flags override the environment / .env values.
#[derive(Parser, Debug)]
#[command(name = "fleet_bot_rust", version, about = "Per-symbol trading fleet on a paper venue")]
struct Cli {
    /// Comma-separated symbols, e.g. EURUSD,USDJPY
    #[arg(long)]
    symbols: Option<String>,
    #[arg(long)]
    metrics_port: Option<u16>,
    /// JSONL event file
    #[arg(long)]
    record_file: Option<String>,
    /// mean_reversion | vol_breakout
    #[arg(long)]
    strategy: Option<String>,
    /// Seconds between fleet status log lines
    #[arg(long, env = "STATUS_LOG_SECS", default_value_t = 60)]
    status_every: u64,
    /// Close every open position before stopping on Ctrl-C
    #[arg(long, env = "FLATTEN_ON_EXIT", default_value_t = false)]
    flatten_on_exit: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let cli = Cli::parse();
    let mut cfg = match config::load() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };
    if let Some(raw) = &cli.symbols {
        cfg.symbols = config::parse_symbols(raw);
    }
    if let Some(port) = cli.metrics_port {
        cfg.metrics_port = port;
    }
    if cli.record_file.is_some() {
        cfg.record_file = cli.record_file.clone();
    }
    if let Some(raw) = &cli.strategy {
        match StrategyMode::parse(raw) {
            Some(m) => cfg.strategy = m,
            None => {
                error!(strategy = %raw, "unknown strategy");
                return ExitCode::from(2);
            }
        }
    }
    if let Err(e) = cfg.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::from(2);
    }

    // ---- Metrics ----
    metrics::init();
    let _metrics_srv = metrics::serve_metrics(cfg.metrics_port);
    metrics::CONFIG_STRATEGY_ACTIVE.with_label_values(&[cfg.strategy.as_str()]).set(1);

    // ---- Recorder (optional) ----
    let (recorder, rec_task) = match cfg.record_file.clone() {
        Some(path) => {
            let (r, h) = Recorder::spawn(path, 8192);
            (r, Some(h))
        }
        None => (Recorder::disabled(), None),
    };

    // ---- Broker session + shared risk gate ----
    let paper = PaperBroker::new(PaperConfig {
        balance: cfg.risk.starting_balance,
        contract_size: cfg.risk.contract_size,
        ..Default::default()
    });
    let broker: Arc<dyn Broker> = Arc::new(SerializedBroker::new(paper));
    let gate = Arc::new(RiskGate::new(cfg.risk.clone()));
    match bounded(broker.call_timeout(), broker.account_balance()).await {
        Ok(balance) => gate.set_initial_balance(balance),
        Err(e) => warn!(error = %e, "account balance unavailable, using configured starting balance"),
    }
    let pipeline = Arc::new(ExecutionPipeline::new(
        cfg.execution.clone(),
        broker.clone(),
        gate.clone(),
        recorder.clone(),
    ));

    let generator: Arc<dyn SignalGenerator> = match cfg.strategy {
        StrategyMode::MeanReversion => Arc::new(MeanReversion::default()),
        StrategyMode::VolBreakout => Arc::new(VolBreakout::default()),
    };
    let management: Arc<dyn TradeManagement> = match cfg.max_hold {
        Some(max_hold) => Arc::new(TimeBasedExit { max_hold }),
        None => Arc::new(NoTradeManagement),
    };

    info!(
        symbols = ?cfg.symbols,
        strategy = cfg.strategy.as_str(),
        management = management.name(),
        max_workers = cfg.fleet.max_workers,
        tick = ?cfg.worker.tick_interval,
        metrics_port = cfg.metrics_port,
        record_file = ?cfg.record_file,
        "startup config"
    );

    // ---- Fleet ----
    let fleet = Arc::new(Fleet::new(
        cfg.fleet.clone(),
        cfg.worker.clone(),
        WorkerDeps {
            broker: broker.clone(),
            generator,
            gate: gate.clone(),
            pipeline,
            management,
            recorder: recorder.clone(),
            clock: utc_day_clock(),
        },
    ));
    for sym in &cfg.symbols {
        if let Err(e) = fleet.create_worker(sym, None).await {
            error!(symbol = %sym, error = %e, "worker not created");
        }
    }

    recorder.record(Event::Note {
        message: format!("fleet started: symbols={:?} strategy={}", cfg.symbols, cfg.strategy.as_str()),
    });

    // ---- Supervisor ----
    let supervisor = Arc::new(HeartbeatSupervisor::new(cfg.supervisor.clone(), fleet.clone(), broker.clone())).spawn();

    // ---- Heartbeat until Ctrl-C ----
    let mut status_tick = interval(Duration::from_secs(cli.status_every.max(1)));
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        select! {
            _ = status_tick.tick() => {
                let st = fleet.aggregate_status().await;
                info!(
                    workers = st.total_workers,
                    active = st.active_workers,
                    open_positions = st.total_open_positions,
                    daily_trades = st.total_daily_trades,
                    daily_pnl = st.total_daily_pnl,
                    balance = st.ledger.current_balance,
                    drawdown_pct = st.ledger.drawdown_pct(),
                    breaker = st.breaker_tripped,
                    "heartbeat"
                );
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    error!(error = %e, "ctrl-c handler failed, shutting down");
                }
                break;
            }
        }
    }

    // ---- Shutdown ----
    info!("shutdown requested");
    supervisor.stop().await;
    if cli.flatten_on_exit {
        let report = fleet.emergency_shutdown().await;
        if !report.left_running.is_empty() {
            error!(left_running = ?report.left_running, "positions still open after flatten");
        }
    }
    let report = fleet.stop_all().await;
    info!(stopped = ?report.stopped, failures = ?report.failures, "fleet stopped");
    let daily = gate.daily_report();
    info!(report = ?daily, "daily report");
    recorder.record(Event::Note {
        message: format!(
            "shutdown: pnl={:.2} closes={} win_rate={:.1}% tripped={}",
            daily.daily_pnl, daily.closes, daily.win_rate_pct, daily.tripped
        ),
    });

    drop(fleet);
    if recorder.dropped() > 0 {
        warn!(dropped = recorder.dropped(), "recorder dropped events under load");
    }
    drop(recorder);
    if let Some(h) = rec_task {
        if timeout(Duration::from_secs(3), h).await.is_err() {
            warn!("recorder did not drain in time");
        }
    }
    ExitCode::SUCCESS
}
