// ===============================
// src/fleet.rs
// ===============================
//
// Registry of per-symbol workers. One worker (and so one live loop) per
// symbol, bounded by `max_workers`. A handle leaving the registry is retired
// first, so nothing can start its loop again behind the registry's back.
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::broker::bounded;
use crate::config::{FleetConfig, WorkerConfig, WorkerConfigPatch};
use crate::metrics::{CONFIG_SYMBOL, FLEET_WORKERS};
use crate::risk::RiskLedger;
use crate::worker::{Worker, WorkerDeps, WorkerError, WorkerState};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("a worker for {0} already exists")]
    DuplicateSymbol(String),
    #[error("fleet is at capacity ({0} workers)")]
    CapacityReached(usize),
    #[error("no worker for {0}")]
    UnknownSymbol(String),
    #[error("invalid symbol {0:?}")]
    InvalidSymbol(String),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Debug, Default, Serialize)]
pub struct StopReport {
    pub stopped: Vec<String>,
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Default, Serialize)]
pub struct EmergencyReport {
    pub closed: Vec<(String, u64)>,
    pub close_failures: Vec<(String, u64, String)>,
    pub stopped: Vec<String>,
    /// workers left running because some of their positions are still open
    pub left_running: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FleetStatus {
    pub total_workers: usize,
    pub active_workers: usize,
    pub total_open_positions: usize,
    pub total_daily_trades: u32,
    pub total_daily_pnl: f64,
    pub breaker_tripped: bool,
    pub breaker_reason: Option<String>,
    pub ledger: RiskLedger,
    pub workers: Vec<WorkerState>,
}

pub struct Fleet {
    cfg: FleetConfig,
    default_worker: WorkerConfig,
    deps: WorkerDeps,
    registry: RwLock<HashMap<String, Worker>>,
}

fn normalise(symbol: &str) -> Result<String, FleetError> {
    let s = symbol.trim().to_ascii_uppercase();
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(FleetError::InvalidSymbol(symbol.to_string()));
    }
    Ok(s)
}

impl Fleet {
    pub fn new(cfg: FleetConfig, default_worker: WorkerConfig, deps: WorkerDeps) -> Self {
        Self { cfg, default_worker, deps, registry: RwLock::new(HashMap::new()) }
    }

    pub fn deps(&self) -> &WorkerDeps {
        &self.deps
    }

    /// Builds and starts a worker. Rejects duplicates and a full registry
    /// without touching existing workers.
    pub async fn create_worker(&self, symbol: &str, config: Option<WorkerConfig>) -> Result<Worker, FleetError> {
        let symbol = normalise(symbol)?;
        let mut reg = self.registry.write().await;
        if reg.contains_key(&symbol) {
            return Err(FleetError::DuplicateSymbol(symbol));
        }
        if reg.len() >= self.cfg.max_workers {
            return Err(FleetError::CapacityReached(self.cfg.max_workers));
        }
        let worker = Worker::new(&symbol, config.unwrap_or_else(|| self.default_worker.clone()), self.deps.clone())?;
        worker.start().await?;
        reg.insert(symbol.clone(), worker.clone());
        FLEET_WORKERS.set(reg.len() as i64);
        CONFIG_SYMBOL.with_label_values(&[&symbol]).set(1);
        info!(%symbol, workers = reg.len(), "worker created");
        Ok(worker)
    }

    pub async fn get_worker(&self, symbol: &str) -> Option<Worker> {
        let symbol = normalise(symbol).ok()?;
        self.registry.read().await.get(&symbol).cloned()
    }

    /// Snapshot of the handles, sorted by symbol.
    pub async fn workers(&self) -> Vec<Worker> {
        let mut ws: Vec<Worker> = self.registry.read().await.values().cloned().collect();
        ws.sort_by(|a, b| a.symbol().cmp(b.symbol()));
        ws
    }

    async fn remove(&self, symbol: &str) {
        let mut reg = self.registry.write().await;
        if let Some(worker) = reg.remove(symbol) {
            worker.retire();
            FLEET_WORKERS.set(reg.len() as i64);
            CONFIG_SYMBOL.with_label_values(&[symbol]).set(0);
        }
    }

    /// Stops the worker and drops it from the registry.
    pub async fn stop_worker(&self, symbol: &str) -> Result<(), FleetError> {
        let worker = self.get_worker(symbol).await.ok_or_else(|| FleetError::UnknownSymbol(symbol.to_string()))?;
        worker.retire();
        let res = worker.stop().await;
        self.remove(worker.symbol()).await;
        res.map_err(FleetError::from)
    }

    pub async fn restart_worker(&self, symbol: &str) -> Result<(), FleetError> {
        let worker = self.get_worker(symbol).await.ok_or_else(|| FleetError::UnknownSymbol(symbol.to_string()))?;
        worker.restart().await?;
        Ok(())
    }

    pub async fn update_worker_config(&self, symbol: &str, patch: &WorkerConfigPatch) -> Result<WorkerConfig, FleetError> {
        let worker = self.get_worker(symbol).await.ok_or_else(|| FleetError::UnknownSymbol(symbol.to_string()))?;
        Ok(worker.update_config(patch)?)
    }

    /// Stops every worker concurrently. One failed stop does not abort the rest.
    pub async fn stop_all(&self) -> StopReport {
        let workers: Vec<Worker> = {
            let mut reg = self.registry.write().await;
            let drained = reg.drain().map(|(_, w)| w).collect();
            FLEET_WORKERS.set(0);
            drained
        };
        let results = join_all(workers.iter().map(|w| async move {
            w.retire();
            (w.symbol().to_string(), w.stop().await)
        }))
        .await;

        let mut report = StopReport::default();
        for (symbol, res) in results {
            CONFIG_SYMBOL.with_label_values(&[&symbol]).set(0);
            match res {
                Ok(()) => report.stopped.push(symbol),
                Err(e) => {
                    warn!(%symbol, error = %e, "stop failed");
                    report.failures.push((symbol, e.to_string()));
                }
            }
        }
        report.stopped.sort();
        info!(stopped = report.stopped.len(), failures = report.failures.len(), "all workers stopped");
        report
    }

    /// Per worker: halt new entries, close every open broker position for its
    /// symbol, then stop it. A worker is only stopped once all of its positions
    /// are closed; one left running keeps monitoring with entries halted.
    pub async fn emergency_shutdown(&self) -> EmergencyReport {
        error!("EMERGENCY SHUTDOWN: closing all positions");
        let workers = self.workers().await;
        let per_worker = join_all(workers.iter().map(|w| self.flatten_worker(w))).await;

        let mut report = EmergencyReport::default();
        for (symbol, closed, failures, stopped) in per_worker {
            report.closed.extend(closed.into_iter().map(|t| (symbol.clone(), t)));
            let clean = failures.is_empty();
            report.close_failures.extend(failures.into_iter().map(|(t, e)| (symbol.clone(), t, e)));
            if clean && stopped {
                self.remove(&symbol).await;
                report.stopped.push(symbol);
            } else {
                report.left_running.push(symbol);
            }
        }
        error!(
            closed = report.closed.len(),
            close_failures = report.close_failures.len(),
            left_running = ?report.left_running,
            "emergency shutdown finished"
        );
        report
    }

    async fn flatten_worker(&self, worker: &Worker) -> (String, Vec<u64>, Vec<(u64, String)>, bool) {
        let symbol = worker.symbol().to_string();
        let broker = &self.deps.broker;
        let mut closed = Vec::new();
        let mut failures = Vec::new();

        // an order already in flight settles before the position query
        worker.halt_entries().await;
        match bounded(broker.call_timeout(), broker.get_open_positions(&symbol)).await {
            Ok(positions) => {
                for p in positions {
                    match self.deps.pipeline.close_position(&symbol, p.ticket, "emergency shutdown").await {
                        Ok(_) => closed.push(p.ticket),
                        Err(e) => failures.push((p.ticket, e.to_string())),
                    }
                }
            }
            // ticket 0: the position list itself was unavailable
            Err(e) => failures.push((0, e.to_string())),
        }

        if !failures.is_empty() {
            error!(%symbol, failures = failures.len(), "positions still open, worker left running");
            return (symbol, closed, failures, false);
        }
        worker.retire();
        let stopped = match worker.stop().await {
            Ok(()) => true,
            Err(e) => {
                error!(%symbol, error = %e, "stop after flatten failed");
                false
            }
        };
        (symbol, closed, failures, stopped)
    }

    /// Read-only merge of every worker snapshot plus the shared ledger.
    pub async fn aggregate_status(&self) -> FleetStatus {
        let workers: Vec<WorkerState> = self.workers().await.iter().map(Worker::get_status).collect();
        let gate = &self.deps.gate;
        FleetStatus {
            total_workers: workers.len(),
            active_workers: workers.iter().filter(|s| s.status.is_active()).count(),
            total_open_positions: workers.iter().map(|s| s.open_positions.len()).sum(),
            total_daily_trades: workers.iter().map(|s| s.daily_trades).sum(),
            total_daily_pnl: workers.iter().map(|s| s.daily_pnl).sum(),
            breaker_tripped: gate.is_tripped(),
            breaker_reason: gate.trip_reason(),
            ledger: gate.snapshot(),
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, RiskConfig};
    use crate::domain::Direction;
    use crate::execution::ExecutionPipeline;
    use crate::recorder::Recorder;
    use crate::risk::{utc_day_clock, RiskGate};
    use crate::signal::NoTradeManagement;
    use crate::broker::Broker;
    use crate::testkit::{position, signal, ScriptedBroker, ScriptedGenerator};
    use crate::worker::WorkerStatus;
    use std::sync::Mutex;
    use std::time::Duration;

    fn fleet_with(max_workers: usize, broker: Arc<ScriptedBroker>) -> Fleet {
        fleet_using(max_workers, broker, ScriptedGenerator::none())
    }

    fn fleet_using(max_workers: usize, broker: Arc<ScriptedBroker>, generator: ScriptedGenerator) -> Fleet {
        let gate = Arc::new(RiskGate::new(RiskConfig::default()));
        let pipeline = Arc::new(ExecutionPipeline::new(
            ExecutionConfig::default(),
            broker.clone(),
            gate.clone(),
            Recorder::disabled(),
        ));
        let deps = WorkerDeps {
            broker,
            generator: Arc::new(generator),
            gate,
            pipeline,
            management: Arc::new(NoTradeManagement),
            recorder: Recorder::disabled(),
            clock: utc_day_clock(),
        };
        let wcfg = WorkerConfig { tick_interval: Duration::from_secs(1), ..Default::default() };
        Fleet::new(FleetConfig { max_workers }, wcfg, deps)
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_symbol_is_rejected() {
        let fleet = fleet_with(10, Arc::new(ScriptedBroker::new()));
        fleet.create_worker("eurusd", None).await.unwrap();
        let err = fleet.create_worker("EURUSD ", None).await.unwrap_err();
        assert!(matches!(err, FleetError::DuplicateSymbol(s) if s == "EURUSD"));
        assert_eq!(fleet.workers().await.len(), 1);
        fleet.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_and_invalid_symbols() {
        let fleet = fleet_with(2, Arc::new(ScriptedBroker::new()));
        fleet.create_worker("EURUSD", None).await.unwrap();
        fleet.create_worker("GBPUSD", None).await.unwrap();
        assert!(matches!(fleet.create_worker("USDJPY", None).await, Err(FleetError::CapacityReached(2))));
        assert!(matches!(fleet.create_worker("  ", None).await, Err(FleetError::InvalidSymbol(_))));
        assert!(matches!(fleet.create_worker("EUR/USD", None).await, Err(FleetError::InvalidSymbol(_))));

        fleet.stop_worker("GBPUSD").await.unwrap();
        fleet.create_worker("USDJPY", None).await.unwrap();
        assert!(matches!(fleet.stop_worker("AUDUSD").await, Err(FleetError::UnknownSymbol(_))));
        fleet.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_worker_config_is_refused() {
        let fleet = fleet_with(10, Arc::new(ScriptedBroker::new()));
        let bad = WorkerConfig { max_consecutive_errors: 0, ..Default::default() };
        let err = fleet.create_worker("EURUSD", Some(bad)).await.unwrap_err();
        assert!(matches!(err, FleetError::Worker(WorkerError::Config(_))));
        assert!(fleet.workers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_stops_everyone() {
        let fleet = fleet_with(10, Arc::new(ScriptedBroker::new()));
        let mut handles = Vec::new();
        for s in ["EURUSD", "GBPUSD", "USDJPY"] {
            handles.push(fleet.create_worker(s, None).await.unwrap());
        }
        let report = fleet.stop_all().await;
        assert_eq!(report.stopped, vec!["EURUSD", "GBPUSD", "USDJPY"]);
        assert!(report.failures.is_empty());
        assert!(handles.iter().all(|w| w.status() == WorkerStatus::Stopped));
        assert_eq!(fleet.aggregate_status().await.total_workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_closes_positions_before_stop() {
        let broker = Arc::new(ScriptedBroker::new());
        let fleet = fleet_with(10, broker.clone());
        let worker = fleet.create_worker("EURUSD", None).await.unwrap();
        broker.add_position(position(501, "EURUSD", Direction::Buy, -12.0));
        broker.add_position(position(502, "EURUSD", Direction::Sell, 4.0));

        let seen: Arc<Mutex<Vec<(u64, WorkerStatus)>>> = Arc::new(Mutex::new(Vec::new()));
        let probe = worker.clone();
        let log = seen.clone();
        broker.on_close(move |ticket| log.lock().unwrap().push((ticket, probe.status())));

        let report = fleet.emergency_shutdown().await;
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, st)| *st != WorkerStatus::Stopped));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert_eq!(report.closed.len(), 2);
        assert_eq!(report.stopped, vec!["EURUSD"]);
        let ledger = fleet.deps().gate.snapshot();
        assert_eq!(ledger.closes, 2);
        assert!((ledger.current_balance - 9_992.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_waits_out_a_fill_in_flight() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.set_order_latency(Duration::from_secs(3));
        let fleet = fleet_using(10, broker.clone(), ScriptedGenerator::always(signal("EURUSD", 0.9)));
        let worker = fleet.create_worker("EURUSD", None).await.unwrap();
        let mut rx = worker.subscribe();
        rx.wait_for(|s| s.status == WorkerStatus::Executing).await.unwrap();
        assert!(broker.get_open_positions("EURUSD").await.unwrap().is_empty());

        let report = fleet.emergency_shutdown().await;
        assert_eq!(broker.orders_placed(), 1);
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.stopped, vec!["EURUSD"]);
        assert!(broker.get_open_positions("EURUSD").await.unwrap().is_empty());
        assert_eq!(fleet.deps().gate.snapshot().closes, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(broker.orders_placed(), 1);
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_leaves_worker_running_when_close_fails() {
        let broker = Arc::new(ScriptedBroker::new());
        let fleet = fleet_with(10, broker.clone());
        let worker = fleet.create_worker("EURUSD", None).await.unwrap();
        broker.add_position(position(601, "EURUSD", Direction::Buy, 0.0));
        broker.fail_closes(true);

        let report = fleet.emergency_shutdown().await;
        assert_eq!(report.left_running, vec!["EURUSD"]);
        assert_eq!(report.close_failures.len(), 1);
        assert!(worker.status().is_active());
        assert!(worker.entries_halted());
        assert!(!worker.is_retired());
        assert!(fleet.get_worker("EURUSD").await.is_some());
        fleet.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_and_config_update_by_symbol() {
        let fleet = fleet_with(10, Arc::new(ScriptedBroker::new()));
        let worker = fleet.create_worker("EURUSD", None).await.unwrap();
        fleet.restart_worker("eurusd").await.unwrap();
        assert!(worker.status().is_active());

        let patch = WorkerConfigPatch { max_daily_trades: Some(9), ..Default::default() };
        let next = fleet.update_worker_config("EURUSD", &patch).await.unwrap();
        assert_eq!(next.max_daily_trades, 9);
        assert_eq!(worker.config().max_daily_trades, 9);
        assert!(matches!(fleet.restart_worker("GBPUSD").await, Err(FleetError::UnknownSymbol(_))));
        fleet.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_is_read_only() {
        let broker = Arc::new(ScriptedBroker::new());
        let fleet = fleet_with(10, broker);
        fleet.create_worker("EURUSD", None).await.unwrap();
        fleet.create_worker("GBPUSD", None).await.unwrap();
        let a = fleet.aggregate_status().await;
        let b = fleet.aggregate_status().await;
        assert_eq!(a.total_workers, 2);
        assert_eq!(a.active_workers, 2);
        assert!(!a.breaker_tripped);
        assert_eq!(a.total_daily_trades, b.total_daily_trades);
        assert_eq!(a.workers.iter().map(|w| w.symbol.clone()).collect::<Vec<_>>(), vec!["EURUSD", "GBPUSD"]);
        fleet.stop_all().await;
    }
}
