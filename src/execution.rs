// ===============================
// src/execution.rs
// ===============================
//
// Signal -> order, in order:
//   1) pre-checks (breaker, auto-execute confidence, risk validation, session)
//   2) sizing from risk-per-trade and stop distance
//   3) order placement under the broker's timeout
//   4) slippage bookkeeping + RecordFill
// Every failure becomes a non-success ExecutionOutcome; nothing escapes as an error.
//
// Closes are accounted into the RiskGate exactly once per ticket, whichever
// path (worker exit rule, emergency shutdown, broker-side stop) sees them first.
// Settled tickets are remembered for the current and the previous trading day.
//
use std::sync::{Arc, Mutex};

use ahash::AHashSet;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::broker::{bounded, Broker, BrokerError};
use crate::config::ExecutionConfig;
use crate::domain::{pip_size, CloseResult, Event, ExecutionOutcome, OrderRequest, TradingSignal};
use crate::metrics::{CLOSES, EXECUTIONS, SLIPPAGE_PIPS};
use crate::recorder::Recorder;
use crate::risk::{RiskError, RiskGate, TradeCheck};

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("circuit breaker is tripped")]
    BreakerTripped,
    #[error("confidence {confidence:.2} below auto-execute threshold {threshold:.2}")]
    LowConfidence { confidence: f64, threshold: f64 },
    #[error("risk check failed: {0}")]
    Risk(RiskError),
    #[error("broker session not connected")]
    BrokerDisconnected,
    #[error("position size {0} rounds to zero")]
    ZeroSize(f64),
    #[error("broker: {0}")]
    Broker(BrokerError),
}

impl ExecutionError {
    /// Metric label for the outcome.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionError::BreakerTripped => "breaker",
            ExecutionError::LowConfidence { .. } => "low_confidence",
            ExecutionError::Risk(_) => "risk",
            ExecutionError::BrokerDisconnected => "disconnected",
            ExecutionError::ZeroSize(_) => "zero_size",
            ExecutionError::Broker(BrokerError::Timeout(_)) => "timeout",
            ExecutionError::Broker(_) => "broker",
        }
    }
}

#[derive(Default)]
struct Settled {
    day: Option<NaiveDate>,
    today: AHashSet<u64>,
    yesterday: AHashSet<u64>,
}

impl Settled {
    fn insert(&mut self, day: NaiveDate, ticket: u64) -> bool {
        if self.day != Some(day) {
            self.yesterday = std::mem::take(&mut self.today);
            self.day = Some(day);
        }
        !self.yesterday.contains(&ticket) && self.today.insert(ticket)
    }

    fn len(&self) -> usize {
        self.today.len() + self.yesterday.len()
    }
}

pub struct ExecutionPipeline {
    cfg: ExecutionConfig,
    broker: Arc<dyn Broker>,
    gate: Arc<RiskGate>,
    recorder: Recorder,
    settled: Mutex<Settled>,
}

impl ExecutionPipeline {
    pub fn new(cfg: ExecutionConfig, broker: Arc<dyn Broker>, gate: Arc<RiskGate>, recorder: Recorder) -> Self {
        Self { cfg, broker, gate, recorder, settled: Mutex::new(Settled::default()) }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.cfg
    }

    fn pre_check(&self, signal: &TradingSignal) -> Result<(), ExecutionError> {
        if self.gate.is_tripped() {
            return Err(ExecutionError::BreakerTripped);
        }
        if signal.confidence() < self.cfg.auto_execute_threshold {
            return Err(ExecutionError::LowConfidence {
                confidence: signal.confidence(),
                threshold: self.cfg.auto_execute_threshold,
            });
        }
        self.gate
            .validate_trade(&TradeCheck {
                direction: signal.direction(),
                entry: signal.entry(),
                stop_loss: signal.stop_loss(),
                take_profit: signal.take_profit(),
                size: signal.size().unwrap_or(self.cfg.validation_size),
            })
            .map_err(ExecutionError::Risk)?;
        if !self.broker.is_connected() {
            return Err(ExecutionError::BrokerDisconnected);
        }
        Ok(())
    }

    fn reject(&self, signal: &TradingSignal, err: ExecutionError) -> ExecutionOutcome {
        match &err {
            ExecutionError::Broker(_) | ExecutionError::BrokerDisconnected => {
                warn!(symbol = %signal.symbol(), error = %err, "execution failed")
            }
            _ => info!(symbol = %signal.symbol(), reason = %err, "execution skipped"),
        }
        EXECUTIONS.with_label_values(&[signal.symbol(), err.label()]).inc();
        let outcome = ExecutionOutcome::rejected(signal.symbol(), err);
        self.recorder.record(Event::Execution(outcome.clone()));
        outcome
    }

    pub async fn execute(&self, signal: &TradingSignal) -> ExecutionOutcome {
        if let Err(e) = self.pre_check(signal) {
            return self.reject(signal, e);
        }

        let size = signal.size().unwrap_or_else(|| self.gate.position_size(signal.entry(), signal.stop_loss()));
        if !size.is_finite() || size <= 0.0 {
            return self.reject(signal, ExecutionError::ZeroSize(size));
        }

        let req = OrderRequest {
            symbol: signal.symbol().to_string(),
            direction: signal.direction(),
            size,
            price: signal.entry(),
            stop_loss: signal.stop_loss(),
            take_profit: signal.take_profit(),
            comment: format!("fleet conf={:.2} rr={:.2}", signal.confidence(), signal.risk_reward()),
            magic: self.cfg.magic_number,
        };
        let fill = match bounded(self.broker.call_timeout(), self.broker.place_order(&req)).await {
            Ok(f) => f,
            Err(e) => return self.reject(signal, ExecutionError::Broker(e)),
        };

        let slippage = (fill.executed_price - signal.entry()).abs();
        let slippage_pips = slippage / pip_size(signal.symbol());
        SLIPPAGE_PIPS.observe(slippage_pips);
        if slippage_pips > self.cfg.max_slippage_pips {
            warn!(
                symbol = %signal.symbol(),
                slippage_pips,
                max = self.cfg.max_slippage_pips,
                "high slippage"
            );
        }
        self.gate.record_fill(signal.symbol(), signal.direction(), fill.executed_price, fill.size);
        EXECUTIONS.with_label_values(&[signal.symbol(), "filled"]).inc();
        info!(
            symbol = %signal.symbol(),
            direction = %signal.direction(),
            ticket = fill.ticket,
            requested = signal.entry(),
            executed = fill.executed_price,
            size = fill.size,
            slippage_pips,
            "order filled"
        );

        let outcome = ExecutionOutcome {
            success: true,
            symbol: signal.symbol().to_string(),
            ticket: Some(fill.ticket),
            executed_price: Some(fill.executed_price),
            size: Some(fill.size),
            slippage: Some(slippage),
            slippage_pips: Some(slippage_pips),
            failure: None,
            at: Utc::now(),
        };
        self.recorder.record(Event::Execution(outcome.clone()));
        outcome
    }

    /// Closes through the broker and accounts the realized P&L.
    pub async fn close_position(&self, symbol: &str, ticket: u64, reason: &str) -> Result<CloseResult, ExecutionError> {
        let res = bounded(self.broker.call_timeout(), self.broker.close_position(ticket))
            .await
            .map_err(|e| {
                error!(%symbol, ticket, error = %e, %reason, "close failed");
                ExecutionError::Broker(e)
            })?;
        info!(%symbol, ticket, pnl = res.pnl, close_price = res.close_price, %reason, "position closed");
        self.account_close(symbol, ticket, res.pnl, "pipeline");
        Ok(res)
    }

    /// Feeds a realized P&L into the ledger once per ticket. Returns false for a repeat.
    pub fn account_close(&self, symbol: &str, ticket: u64, pnl: f64, source: &str) -> bool {
        let day = self.gate.trading_day();
        let fresh = self.settled.lock().unwrap_or_else(|p| p.into_inner()).insert(day, ticket);
        if !fresh {
            return false;
        }
        let tripped = self.gate.record_close(pnl);
        CLOSES.with_label_values(&[symbol, source]).inc();
        self.recorder.record(Event::Close { symbol: symbol.to_string(), ticket, pnl, at: Utc::now() });
        if let Some(reason) = tripped {
            let balance = self.gate.snapshot().current_balance;
            self.recorder.record(Event::Breaker { reason, balance, at: Utc::now() });
        }
        true
    }

    /// Tickets currently remembered as settled.
    pub fn settled_count(&self) -> usize {
        self.settled.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<(), ExecutionError> {
        bounded(self.broker.call_timeout(), self.broker.modify_position(ticket, sl, tp))
            .await
            .map_err(ExecutionError::Broker)
    }
}
