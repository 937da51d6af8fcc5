// ===============================
// src/supervisor.rs
// ===============================
//
// Heartbeat sweep, independent of any worker's own tick:
// - a dropped broker session gets one reconnect attempt per sweep
// - workers parked in Error get Stop -> restart_delay -> Start
// A worker removed from the fleet meanwhile is retired and stays down.
//
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::{bounded, Broker};
use crate::config::SupervisorConfig;
use crate::fleet::Fleet;
use crate::metrics::{BROKER_RECONNECTS, SUPERVISOR_RESTARTS};
use crate::worker::{WorkerError, WorkerStatus};

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub restarted: Vec<String>,
    pub restart_failures: Vec<(String, String)>,
    /// None when the session was healthy
    pub reconnected: Option<bool>,
}

pub struct HeartbeatSupervisor {
    cfg: SupervisorConfig,
    fleet: Arc<Fleet>,
    broker: Arc<dyn Broker>,
}

/// Running supervisor loop.
pub struct SupervisorHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SupervisorHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "supervisor task did not exit cleanly");
        }
    }
}

impl HeartbeatSupervisor {
    pub fn new(cfg: SupervisorConfig, fleet: Arc<Fleet>, broker: Arc<dyn Broker>) -> Self {
        Self { cfg, fleet, broker }
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        if !self.broker.is_connected() {
            warn!("broker session down, reconnecting");
            let ok = match bounded(self.broker.call_timeout(), self.broker.reconnect()).await {
                Ok(()) => {
                    info!("broker session reconnected");
                    true
                }
                Err(e) => {
                    error!(error = %e, "broker reconnect failed");
                    false
                }
            };
            BROKER_RECONNECTS.with_label_values(&[if ok { "ok" } else { "error" }]).inc();
            report.reconnected = Some(ok);
        }

        for worker in self.fleet.workers().await {
            if worker.status() != WorkerStatus::Error || worker.is_retired() {
                continue;
            }
            let symbol = worker.symbol().to_string();
            warn!(%symbol, last_error = ?worker.get_status().last_error, "worker in error, restarting");
            if let Err(e) = worker.stop().await {
                warn!(%symbol, error = %e, "stop before restart failed");
            }
            sleep(self.cfg.restart_delay).await;
            match worker.start().await {
                Ok(()) => {
                    SUPERVISOR_RESTARTS.with_label_values(&[&symbol]).inc();
                    info!(%symbol, "worker restarted");
                    report.restarted.push(symbol);
                }
                Err(WorkerError::Retired(_)) => {
                    info!(%symbol, "worker left the fleet during restart, not restarted");
                }
                Err(e) => {
                    error!(%symbol, error = %e, "restart failed");
                    report.restart_failures.push((symbol, e.to_string()));
                }
            }
        }

        debug!(restarted = report.restarted.len(), reconnected = ?report.reconnected, "heartbeat sweep");
        report
    }

    /// Sweeps every `interval` until the handle is stopped.
    pub fn spawn(self: Arc<Self>) -> SupervisorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut tick = interval(self.cfg.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick fires immediately; the first sweep waits one full interval
            tick.tick().await;
            info!(interval = ?self.cfg.interval, "heartbeat supervisor started");
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        self.sweep().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("heartbeat supervisor stopped");
        });
        SupervisorHandle { stop_tx, handle }
    }
}
