// ===============================
// src/worker.rs
// ===============================
//
// One autonomous loop per symbol:
//
//   Idle -> Monitoring -> (Analyzing -> Executing)* -> Monitoring ...
//             |  breaker tripped   -> CircuitBreakerPaused (cooldown, not an error)
//             |  N transient errors -> Error (loop exits, supervisor restarts it)
//             '- Stop              -> Stopped
//
// Each tick: price (alert on large moves) -> candles -> signal -> local
// admission -> ExecutionPipeline -> reconcile open positions.
// Every sleep races the stop signal, so Stop never waits behind a cooldown.
//
// A handle dropped from the fleet registry is retired and can never start a
// loop again. Entries can be halted while the loop keeps monitoring.
//
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{bounded, Broker, BrokerError};
use crate::config::{ConfigError, WorkerConfig, WorkerConfigPatch};
use crate::domain::{Event, ExecutionOutcome, OpenPosition, SignalError, TradingSignal};
use crate::execution::ExecutionPipeline;
use crate::metrics::{PRICE_ALERTS, SIGNAL_DECISIONS, WORKER_ERRORS, WORKER_ITERATIONS, WORKER_STATUS};
use crate::recorder::Recorder;
use crate::risk::{DayClock, RiskGate, TradeCheck};
use crate::signal::{SignalGenerator, TradeManagement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WorkerStatus {
    Idle,
    Monitoring,
    Analyzing,
    Executing,
    CircuitBreakerPaused,
    Error,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Monitoring => "monitoring",
            WorkerStatus::Analyzing => "analyzing",
            WorkerStatus::Executing => "executing",
            WorkerStatus::CircuitBreakerPaused => "circuit_breaker_paused",
            WorkerStatus::Error => "error",
            WorkerStatus::Stopped => "stopped",
        }
    }

    pub fn code(&self) -> i64 {
        *self as i64
    }

    /// A loop is (or should be) running in this state.
    pub fn is_active(&self) -> bool {
        !matches!(self, WorkerStatus::Idle | WorkerStatus::Error | WorkerStatus::Stopped)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a worker. Only the worker's own loop mutates the live copy.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub symbol: String,
    pub status: WorkerStatus,
    pub last_price: Option<f64>,
    pub last_signal_at: Option<DateTime<Utc>>,
    pub trading_day: NaiveDate,
    pub daily_trades: u32,
    pub daily_pnl: f64,
    pub open_positions: Vec<OpenPosition>,
    pub consecutive_errors: u32,
    pub backoff: Duration,
    pub last_error: Option<String>,
    pub last_outcome: Option<ExecutionOutcome>,
    pub iterations: u64,
}

impl WorkerState {
    fn new(symbol: &str, day: NaiveDate, backoff: Duration) -> Self {
        Self {
            symbol: symbol.to_string(),
            status: WorkerStatus::Idle,
            last_price: None,
            last_signal_at: None,
            trading_day: day,
            daily_trades: 0,
            daily_pnl: 0.0,
            open_positions: Vec::new(),
            consecutive_errors: 0,
            backoff,
            last_error: None,
            last_outcome: None,
            iterations: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {0} is already running")]
    AlreadyRunning(String),
    #[error("worker {0} was removed from the fleet")]
    Retired(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("worker task for {symbol} failed: {reason}")]
    Join { symbol: String, reason: String },
}

impl From<BrokerError> for WorkerError {
    fn from(e: BrokerError) -> Self {
        WorkerError::Transient(e.to_string())
    }
}

impl From<SignalError> for WorkerError {
    fn from(e: SignalError) -> Self {
        WorkerError::Transient(e.to_string())
    }
}

/// Collaborators shared by every worker in a fleet.
#[derive(Clone)]
pub struct WorkerDeps {
    pub broker: Arc<dyn Broker>,
    pub generator: Arc<dyn SignalGenerator>,
    pub gate: Arc<RiskGate>,
    pub pipeline: Arc<ExecutionPipeline>,
    pub management: Arc<dyn TradeManagement>,
    pub recorder: Recorder,
    pub clock: DayClock,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<WorkerState>,
}

struct Inner {
    symbol: String,
    deps: WorkerDeps,
    config_tx: watch::Sender<WorkerConfig>,
    status_tx: watch::Sender<WorkerState>,
    slot: Mutex<Option<Running>>,
    retired: AtomicBool,
    entries_halted: AtomicBool,
    // held from admission through execution
    entry: Mutex<()>,
}

/// Cheap, cloneable handle to one symbol's loop.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    pub fn new(symbol: &str, config: WorkerConfig, deps: WorkerDeps) -> Result<Self, WorkerError> {
        config.validate()?;
        let state = WorkerState::new(symbol, (deps.clock)(), config.backoff_base);
        let (config_tx, _) = watch::channel(config);
        let (status_tx, _) = watch::channel(state);
        Ok(Self {
            inner: Arc::new(Inner {
                symbol: symbol.to_string(),
                deps,
                config_tx,
                status_tx,
                slot: Mutex::new(None),
                retired: AtomicBool::new(false),
                entries_halted: AtomicBool::new(false),
                entry: Mutex::new(()),
            }),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.inner.symbol
    }

    pub fn get_status(&self) -> WorkerState {
        self.inner.status_tx.borrow().clone()
    }

    pub fn status(&self) -> WorkerStatus {
        self.inner.status_tx.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.inner.status_tx.subscribe()
    }

    pub fn config(&self) -> WorkerConfig {
        self.inner.config_tx.borrow().clone()
    }

    /// Validates the merged config, then hands it to the loop for its next tick.
    pub fn update_config(&self, patch: &WorkerConfigPatch) -> Result<WorkerConfig, WorkerError> {
        let next = self.config().apply(patch)?;
        self.inner.config_tx.send_replace(next.clone());
        info!(symbol = %self.inner.symbol, ?patch, "worker config updated");
        Ok(next)
    }

    /// Marks the handle as no longer registered. Any later `start` fails, and a
    /// `stop` issued after this leaves no loop behind.
    pub fn retire(&self) {
        self.inner.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::SeqCst)
    }

    /// Refuses every further signal and waits for an order already in flight
    /// to settle. The loop keeps running and monitoring its positions.
    pub async fn halt_entries(&self) {
        self.inner.entries_halted.store(true, Ordering::SeqCst);
        let _in_flight = self.inner.entry.lock().await;
        info!(symbol = %self.inner.symbol, "new entries halted");
    }

    pub fn resume_entries(&self) {
        if self.inner.entries_halted.swap(false, Ordering::SeqCst) {
            info!(symbol = %self.inner.symbol, "new entries resumed");
        }
    }

    pub fn entries_halted(&self) -> bool {
        self.inner.entries_halted.load(Ordering::SeqCst)
    }

    /// Spawns the loop. Allowed from Idle, Error and Stopped, never once retired.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut slot = self.inner.slot.lock().await;
        if self.is_retired() {
            return Err(WorkerError::Retired(self.inner.symbol.clone()));
        }
        let mut state = match slot.take() {
            Some(run) if !run.handle.is_finished() => {
                *slot = Some(run);
                return Err(WorkerError::AlreadyRunning(self.inner.symbol.clone()));
            }
            // loop already exited on its own (error ceiling)
            Some(run) => match run.handle.await {
                Ok(s) => s,
                Err(e) => {
                    warn!(symbol = %self.inner.symbol, error = %e, "previous loop did not exit cleanly");
                    self.get_status()
                }
            },
            None => self.get_status(),
        };

        let cfg = self.config();
        state.consecutive_errors = 0;
        state.backoff = cfg.backoff_base;
        self.inner.set_status(&mut state, WorkerStatus::Monitoring);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.inner.clone(), state, stop_rx));
        *slot = Some(Running { stop_tx, handle });
        info!(symbol = %self.inner.symbol, "worker started");
        Ok(())
    }

    /// Signals the loop and waits for it to exit. Ends in Stopped from any state.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let mut slot = self.inner.slot.lock().await;
        let (mut state, joined) = match slot.take() {
            Some(run) => {
                let _ = run.stop_tx.send(true);
                match run.handle.await {
                    Ok(s) => (s, Ok(())),
                    Err(e) => (
                        self.get_status(),
                        Err(WorkerError::Join { symbol: self.inner.symbol.clone(), reason: e.to_string() }),
                    ),
                }
            }
            None => (self.get_status(), Ok(())),
        };
        self.inner.set_status(&mut state, WorkerStatus::Stopped);
        info!(symbol = %self.inner.symbol, open_positions = state.open_positions.len(), "worker stopped");
        joined
    }

    pub async fn restart(&self) -> Result<(), WorkerError> {
        if let Err(e) = self.stop().await {
            warn!(symbol = %self.inner.symbol, error = %e, "stop during restart failed");
        }
        self.start().await
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("symbol", &self.inner.symbol)
            .field("status", &self.status())
            .field("retired", &self.is_retired())
            .finish()
    }
}

// Sleeps for `d` unless stop is requested first. Returns true when stopping.
async fn pause(stop_rx: &mut watch::Receiver<bool>, d: Duration) -> bool {
    if *stop_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(d) => *stop_rx.borrow(),
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
    }
}

async fn run_loop(inner: Arc<Inner>, mut state: WorkerState, mut stop_rx: watch::Receiver<bool>) -> WorkerState {
    let symbol = inner.symbol.clone();
    let mut cfg_rx = inner.config_tx.subscribe();

    loop {
        if *stop_rx.borrow() {
            break;
        }
        let cfg = cfg_rx.borrow_and_update().clone();
        inner.roll_day(&mut state);

        if inner.deps.gate.is_tripped() {
            if state.status != WorkerStatus::CircuitBreakerPaused {
                warn!(%symbol, reason = ?inner.deps.gate.trip_reason(), cooldown = ?cfg.breaker_cooldown, "circuit breaker open, pausing");
            }
            inner.set_status(&mut state, WorkerStatus::CircuitBreakerPaused);
            if pause(&mut stop_rx, cfg.breaker_cooldown).await {
                break;
            }
            continue;
        }

        match inner.tick(&mut state, &cfg).await {
            Ok(()) => {
                state.consecutive_errors = 0;
                state.backoff = cfg.backoff_base;
                state.iterations += 1;
                WORKER_ITERATIONS.with_label_values(&[&symbol]).inc();
                inner.set_status(&mut state, WorkerStatus::Monitoring);
                if pause(&mut stop_rx, cfg.tick_interval).await {
                    break;
                }
            }
            Err(e) => {
                state.consecutive_errors += 1;
                state.last_error = Some(e.to_string());
                WORKER_ERRORS.with_label_values(&[&symbol]).inc();
                if state.consecutive_errors >= cfg.max_consecutive_errors {
                    error!(%symbol, errors = state.consecutive_errors, error = %e, "too many consecutive errors, worker parked");
                    inner.set_status(&mut state, WorkerStatus::Error);
                    return state;
                }
                state.backoff = cfg.backoff_for(state.consecutive_errors);
                warn!(%symbol, errors = state.consecutive_errors, backoff = ?state.backoff, error = %e, "tick failed, backing off");
                inner.set_status(&mut state, WorkerStatus::Monitoring);
                if pause(&mut stop_rx, state.backoff).await {
                    break;
                }
            }
        }
    }
    debug!(%symbol, "loop observed stop");
    state
}

impl Inner {
    fn set_status(&self, state: &mut WorkerState, next: WorkerStatus) {
        if state.status != next {
            debug!(symbol = %self.symbol, from = %state.status, to = %next, "worker transition");
            state.status = next;
            WORKER_STATUS.with_label_values(&[&self.symbol]).set(next.code());
            self.deps.recorder.record(Event::WorkerStatus {
                symbol: self.symbol.clone(),
                status: next.as_str().to_string(),
                at: Utc::now(),
            });
        }
        self.status_tx.send_replace(state.clone());
    }

    fn roll_day(&self, state: &mut WorkerState) {
        let today = (self.deps.clock)();
        if state.trading_day != today {
            info!(
                symbol = %self.symbol,
                day = %state.trading_day,
                trades = state.daily_trades,
                pnl = state.daily_pnl,
                "daily stats reset"
            );
            state.trading_day = today;
            state.daily_trades = 0;
            state.daily_pnl = 0.0;
        }
    }

    async fn tick(&self, state: &mut WorkerState, cfg: &WorkerConfig) -> Result<(), WorkerError> {
        let broker = &self.deps.broker;
        let limit = broker.call_timeout();

        let price = bounded(limit, broker.get_current_price(&self.symbol)).await?;
        self.check_price_move(state, price, cfg);

        let candles = bounded(limit, broker.get_historical_candles(&self.symbol, cfg.timeframe, cfg.candle_count)).await?;
        if candles.len() < cfg.min_candles {
            info!(symbol = %self.symbol, have = candles.len(), need = cfg.min_candles, "insufficient history, skipping analysis");
        } else {
            self.set_status(state, WorkerStatus::Analyzing);
            let generator = &self.deps.generator;
            let signal = tokio::time::timeout(
                generator.call_timeout(),
                generator.generate_signal(&self.symbol, &candles, None),
            )
            .await
            .map_err(|_| WorkerError::Transient(format!("signal generation timed out after {:?}", generator.call_timeout())))??;

            if let Some(sig) = signal {
                state.last_signal_at = Some(Utc::now());
                self.deps.recorder.record(Event::Signal(sig.clone()));
                let _entry = self.entry.lock().await;
                if self.admit(&sig, state, cfg) {
                    self.set_status(state, WorkerStatus::Executing);
                    let outcome = self.deps.pipeline.execute(&sig).await;
                    self.apply_outcome(state, &sig, outcome);
                }
            }
        }

        self.monitor_positions(state).await
    }

    fn check_price_move(&self, state: &mut WorkerState, price: f64, cfg: &WorkerConfig) {
        if let Some(prev) = state.last_price.filter(|p| *p > 0.0) {
            let move_pct = (price - prev).abs() / prev * 100.0;
            if move_pct >= cfg.price_alert_pct {
                warn!(symbol = %self.symbol, prev, price, move_pct, "price alert");
                PRICE_ALERTS.with_label_values(&[&self.symbol]).inc();
            }
        }
        state.last_price = Some(price);
    }

    fn admit(&self, sig: &TradingSignal, state: &WorkerState, cfg: &WorkerConfig) -> bool {
        let gate = &self.deps.gate;
        let verdict = if sig.symbol() != self.symbol {
            Err(("symbol", format!("signal for {} on the {} worker", sig.symbol(), self.symbol)))
        } else if self.entries_halted.load(Ordering::SeqCst) {
            Err(("halted", "new entries halted".to_string()))
        } else if sig.confidence() < cfg.min_confidence {
            Err(("low_confidence", format!("confidence {:.2} < {:.2}", sig.confidence(), cfg.min_confidence)))
        } else if state.daily_trades >= cfg.max_daily_trades {
            Err(("daily_cap", format!("daily trade cap {} reached", cfg.max_daily_trades)))
        } else if gate.is_tripped() {
            Err(("breaker", "circuit breaker tripped".to_string()))
        } else {
            gate.validate_trade(&TradeCheck {
                direction: sig.direction(),
                entry: sig.entry(),
                stop_loss: sig.stop_loss(),
                take_profit: sig.take_profit(),
                size: sig.size().unwrap_or(self.deps.pipeline.config().validation_size),
            })
            .map_err(|e| ("risk", e.to_string()))
        };
        match verdict {
            Ok(()) => {
                SIGNAL_DECISIONS.with_label_values(&[&self.symbol, "admitted"]).inc();
                true
            }
            Err((label, reason)) => {
                SIGNAL_DECISIONS.with_label_values(&[&self.symbol, label]).inc();
                info!(symbol = %self.symbol, direction = %sig.direction(), %reason, "signal not admitted");
                false
            }
        }
    }

    fn apply_outcome(&self, state: &mut WorkerState, sig: &TradingSignal, outcome: ExecutionOutcome) {
        if outcome.success {
            if let (Some(ticket), Some(entry), Some(size)) = (outcome.ticket, outcome.executed_price, outcome.size) {
                state.daily_trades += 1;
                state.open_positions.push(OpenPosition {
                    ticket,
                    direction: sig.direction(),
                    entry,
                    stop_loss: sig.stop_loss(),
                    take_profit: sig.take_profit(),
                    size,
                    opened_at: outcome.at,
                    last_profit: 0.0,
                });
            }
        }
        state.last_outcome = Some(outcome);
    }

    // Reconciles local position records with the broker: management hooks for
    // live tickets, close accounting for tickets the broker already closed.
    async fn monitor_positions(&self, state: &mut WorkerState) -> Result<(), WorkerError> {
        if state.open_positions.is_empty() {
            return Ok(());
        }
        let broker = &self.deps.broker;
        let live = bounded(broker.call_timeout(), broker.get_open_positions(&self.symbol)).await?;
        let pipeline = &self.deps.pipeline;
        let management = &self.deps.management;
        let now = Utc::now();

        let mut keep = Vec::with_capacity(state.open_positions.len());
        for mut rec in std::mem::take(&mut state.open_positions) {
            let Some(pos) = live.iter().find(|p| p.ticket == rec.ticket) else {
                if pipeline.account_close(&self.symbol, rec.ticket, rec.last_profit, "broker") {
                    info!(symbol = %self.symbol, ticket = rec.ticket, pnl = rec.last_profit, "position closed broker-side");
                    state.daily_pnl += rec.last_profit;
                }
                continue;
            };
            rec.last_profit = pos.profit;

            if let Some(reason) = management.exit_reason(pos, now).await {
                match pipeline.close_position(&self.symbol, rec.ticket, &reason).await {
                    Ok(c) => {
                        state.daily_pnl += c.pnl;
                        continue;
                    }
                    Err(e) => warn!(symbol = %self.symbol, ticket = rec.ticket, error = %e, "exit close failed, keeping position"),
                }
            } else if let Some(upd) = management.trailing_stop(pos).await {
                match pipeline.modify_position(rec.ticket, upd.stop_loss, upd.take_profit).await {
                    Ok(()) => {
                        rec.stop_loss = upd.stop_loss.unwrap_or(rec.stop_loss);
                        rec.take_profit = upd.take_profit.unwrap_or(rec.take_profit);
                    }
                    Err(e) => warn!(symbol = %self.symbol, ticket = rec.ticket, error = %e, "stop update failed"),
                }
            }
            keep.push(rec);
        }
        state.open_positions = keep;
        Ok(())
    }
}
