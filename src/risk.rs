// ===============================
// src/risk.rs
// ===============================
//
// Account-level circuit breaker + pre-trade validation.
// One RiskGate is shared by the whole fleet; every read-modify-evaluate
// sequence on the ledger happens under a single mutex.
//
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::RiskConfig;
use crate::domain::{risk_reward, Direction};
use crate::metrics::{BREAKER_TRIPPED, BREAKER_TRIPS, LEDGER_BALANCE, LEDGER_DRAWDOWN_PCT};

/// Source of the current trading day.
pub type DayClock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub fn utc_day_clock() -> DayClock {
    Arc::new(|| Utc::now().date_naive())
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskError {
    #[error("circuit breaker is tripped")]
    Tripped,
    #[error("position size {0} must be positive")]
    Size(f64),
    #[error("risk/reward {actual:.2} below minimum {min:.2}")]
    RiskReward { actual: f64, min: f64 },
    #[error("stop {stop} / target {target} on wrong side of entry {entry} for {direction}")]
    Levels { direction: Direction, entry: f64, stop: f64, target: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct TradeCheck {
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub size: f64,
    pub at: DateTime<Utc>,
}

/// Mutable breaker state. `peak_balance >= current_balance` after every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLedger {
    pub day: NaiveDate,
    pub starting_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub consecutive_losses: u32,
    pub tripped: bool,
    pub trip_reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub fills: Vec<FillRecord>,
    pub closes: u32,
    pub wins: u32,
    pub losses: u32,
}

impl RiskLedger {
    fn open(day: NaiveDate, balance: f64) -> Self {
        Self {
            day,
            starting_balance: balance,
            current_balance: balance,
            peak_balance: balance,
            consecutive_losses: 0,
            tripped: false,
            trip_reason: None,
            tripped_at: None,
            fills: Vec::new(),
            closes: 0,
            wins: 0,
            losses: 0,
        }
    }

    /// (peak - current) / peak, in percent
    pub fn drawdown_pct(&self) -> f64 {
        if self.peak_balance <= 0.0 {
            return 0.0;
        }
        (self.peak_balance - self.current_balance) / self.peak_balance * 100.0
    }

    pub fn daily_pnl(&self) -> f64 {
        self.current_balance - self.starting_balance
    }

    pub fn daily_pnl_pct(&self) -> f64 {
        if self.starting_balance <= 0.0 {
            return 0.0;
        }
        self.daily_pnl() / self.starting_balance * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub day: NaiveDate,
    pub starting_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub drawdown_pct: f64,
    pub fills: usize,
    pub closes: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate_pct: f64,
    pub tripped: bool,
    pub trip_reason: Option<String>,
}

pub struct RiskGate {
    cfg: RiskConfig,
    clock: DayClock,
    ledger: Mutex<RiskLedger>,
}

impl RiskGate {
    pub fn new(cfg: RiskConfig) -> Self {
        Self::with_clock(cfg, utc_day_clock())
    }

    pub fn with_clock(cfg: RiskConfig, clock: DayClock) -> Self {
        let ledger = RiskLedger::open(clock(), cfg.starting_balance);
        info!(
            max_drawdown_pct = cfg.max_daily_drawdown_pct,
            max_daily_loss_pct = cfg.max_daily_loss_pct,
            max_consecutive_losses = cfg.max_consecutive_losses,
            balance = cfg.starting_balance,
            "risk gate initialised"
        );
        LEDGER_BALANCE.set(cfg.starting_balance);
        Self { cfg, clock, ledger: Mutex::new(ledger) }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    /// Locks the ledger and applies the day rollover if the calendar day changed.
    fn ledger(&self) -> MutexGuard<'_, RiskLedger> {
        let mut guard = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
        let today = (self.clock)();
        if guard.day != today {
            let carried = guard.current_balance;
            let was_tripped = guard.tripped;
            let prev_reason = guard.trip_reason.clone();
            *guard = RiskLedger::open(today, carried);
            if was_tripped {
                warn!(previous = ?prev_reason, "circuit breaker reset (AUTOMATIC, new day)");
            }
            info!(%today, balance = carried, "new trading day");
            BREAKER_TRIPPED.set(0);
            LEDGER_DRAWDOWN_PCT.set(0.0);
        }
        guard
    }

    pub fn trading_day(&self) -> NaiveDate {
        self.ledger().day
    }

    pub fn is_tripped(&self) -> bool {
        self.ledger().tripped
    }

    pub fn trip_reason(&self) -> Option<String> {
        self.ledger().trip_reason.clone()
    }

    pub fn validate_trade(&self, t: &TradeCheck) -> Result<(), RiskError> {
        if self.is_tripped() {
            return Err(RiskError::Tripped);
        }
        if !t.size.is_finite() || t.size <= 0.0 {
            return Err(RiskError::Size(t.size));
        }
        let levels_ok = match t.direction {
            Direction::Buy => t.stop_loss < t.entry && t.take_profit > t.entry,
            Direction::Sell => t.stop_loss > t.entry && t.take_profit < t.entry,
        };
        if !levels_ok {
            return Err(RiskError::Levels {
                direction: t.direction,
                entry: t.entry,
                stop: t.stop_loss,
                target: t.take_profit,
            });
        }
        let rr = risk_reward(t.entry, t.stop_loss, t.take_profit);
        if rr < self.cfg.min_risk_reward {
            return Err(RiskError::RiskReward { actual: rr, min: self.cfg.min_risk_reward });
        }
        Ok(())
    }

    /// Bookkeeping only; balance moves on close.
    pub fn record_fill(&self, symbol: &str, direction: Direction, entry: f64, size: f64) {
        let mut l = self.ledger();
        l.fills.push(FillRecord { symbol: symbol.to_string(), direction, entry, size, at: Utc::now() });
        debug!(%symbol, %direction, entry, size, "fill recorded");
    }

    /// Applies realized P&L, then evaluates trip conditions in precedence order:
    /// drawdown, daily loss, consecutive losses. Returns the reason when this
    /// close is the one that trips the breaker.
    pub fn record_close(&self, pnl: f64) -> Option<String> {
        let mut l = self.ledger();
        l.current_balance += pnl;
        if l.current_balance > l.peak_balance {
            l.peak_balance = l.current_balance;
        }
        l.closes += 1;
        if pnl < 0.0 {
            l.consecutive_losses += 1;
            l.losses += 1;
        } else {
            l.consecutive_losses = 0;
            if pnl > 0.0 {
                l.wins += 1;
            }
        }
        info!(
            pnl,
            balance = l.current_balance,
            daily_pnl_pct = l.daily_pnl_pct(),
            drawdown_pct = l.drawdown_pct(),
            "position close accounted"
        );
        LEDGER_BALANCE.set(l.current_balance);
        LEDGER_DRAWDOWN_PCT.set(l.drawdown_pct());
        self.evaluate(&mut l)
    }

    fn evaluate(&self, l: &mut RiskLedger) -> Option<String> {
        if l.tripped {
            return None;
        }
        let dd = l.drawdown_pct();
        let day_pct = l.daily_pnl_pct();
        let (label, reason) = if dd > self.cfg.max_daily_drawdown_pct {
            ("drawdown", format!("daily drawdown {dd:.2}% exceeded limit {}%", self.cfg.max_daily_drawdown_pct))
        } else if day_pct < -self.cfg.max_daily_loss_pct {
            ("daily_loss", format!("daily loss {day_pct:.2}% exceeded limit {}%", self.cfg.max_daily_loss_pct))
        } else if l.consecutive_losses >= self.cfg.max_consecutive_losses {
            (
                "consecutive_losses",
                format!("consecutive losses ({}) reached limit {}", l.consecutive_losses, self.cfg.max_consecutive_losses),
            )
        } else {
            return None;
        };
        l.tripped = true;
        l.trip_reason = Some(reason.clone());
        l.tripped_at = Some(Utc::now());
        BREAKER_TRIPPED.set(1);
        BREAKER_TRIPS.with_label_values(&[label]).inc();
        error!(%reason, balance = l.current_balance, daily_pnl_pct = day_pct, "CIRCUIT BREAKER TRIPPED");
        Some(reason)
    }

    pub fn reset(&self, manual: bool) {
        let mut l = self.ledger();
        if l.tripped {
            let kind = if manual { "MANUAL" } else { "AUTOMATIC" };
            warn!(previous = ?l.trip_reason, "circuit breaker reset ({kind})");
        }
        l.tripped = false;
        l.trip_reason = None;
        l.tripped_at = None;
        l.consecutive_losses = 0;
        BREAKER_TRIPPED.set(0);
    }

    /// Re-anchors today's start/current/peak balance (e.g. from the broker account).
    pub fn set_initial_balance(&self, balance: f64) {
        let mut l = self.ledger();
        l.starting_balance = balance;
        l.current_balance = balance;
        l.peak_balance = balance;
        LEDGER_BALANCE.set(balance);
        info!(balance, "starting balance set");
    }

    /// Lots from risk-per-trade and stop distance, floored to the lot step and capped.
    /// Returns 0.0 when the stop distance is degenerate or the size rounds to nothing.
    pub fn position_size(&self, entry: f64, stop_loss: f64) -> f64 {
        let balance = self.ledger().current_balance;
        let stop_distance = (entry - stop_loss).abs();
        if !stop_distance.is_finite() || stop_distance == 0.0 || balance <= 0.0 {
            return 0.0;
        }
        let risk_amount = balance * self.cfg.risk_per_trade_pct / 100.0;
        let raw = risk_amount / (stop_distance * self.cfg.contract_size);
        let steps = (raw / self.cfg.lot_step + 1e-9).floor();
        (steps * self.cfg.lot_step).min(self.cfg.max_lot).max(0.0)
    }

    pub fn snapshot(&self) -> RiskLedger {
        self.ledger().clone()
    }

    pub fn daily_report(&self) -> DailyReport {
        let l = self.ledger();
        let decided = l.wins + l.losses;
        DailyReport {
            day: l.day,
            starting_balance: l.starting_balance,
            current_balance: l.current_balance,
            peak_balance: l.peak_balance,
            daily_pnl: l.daily_pnl(),
            daily_pnl_pct: l.daily_pnl_pct(),
            drawdown_pct: l.drawdown_pct(),
            fills: l.fills.len(),
            closes: l.closes,
            wins: l.wins,
            losses: l.losses,
            win_rate_pct: if decided == 0 { 0.0 } else { l.wins as f64 / decided as f64 * 100.0 },
            tripped: l.tripped,
            trip_reason: l.trip_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn gate() -> RiskGate {
        RiskGate::new(RiskConfig::default())
    }

    fn check(entry: f64, stop: f64, target: f64) -> TradeCheck {
        let direction = if stop < entry { Direction::Buy } else { Direction::Sell };
        TradeCheck { direction, entry, stop_loss: stop, take_profit: target, size: 0.1 }
    }

    #[test]
    fn drawdown_scenario_trips_with_drawdown_reason() {
        let g = gate();
        assert_eq!(g.record_close(-100.0), None);
        let tripped = g.record_close(-120.0);
        assert!(g.is_tripped());
        let reason = g.trip_reason().unwrap();
        assert_eq!(tripped.as_deref(), Some(reason.as_str()));
        assert!(reason.contains("drawdown"), "{reason}");
        let snap = g.snapshot();
        assert!((snap.current_balance - 9_780.0).abs() < 1e-9);
        assert!((snap.drawdown_pct() - 2.2).abs() < 1e-9);
        // later closes do not re-report the trip
        assert_eq!(g.record_close(-10.0), None);
    }

    #[test]
    fn peak_never_below_current_and_monotone() {
        let g = gate();
        let mut last_peak = g.snapshot().peak_balance;
        for pnl in [50.0, -20.0, 130.0, -5.0, 0.0, 75.5, -40.0, 10.0] {
            g.record_close(pnl);
            let s = g.snapshot();
            assert!(s.peak_balance >= s.current_balance);
            assert!(s.peak_balance >= last_peak);
            last_peak = s.peak_balance;
        }
    }

    #[test]
    fn drawdown_measured_from_running_peak() {
        let g = gate();
        g.record_close(1_000.0); // peak 11_000
        g.record_close(-200.0); // 1.82%
        assert!(!g.is_tripped());
        g.record_close(-50.0); // 2.27%
        assert!(g.is_tripped());
        assert!(g.trip_reason().unwrap().contains("drawdown"));
    }

    #[test]
    fn consecutive_losses_trip_last_in_precedence() {
        let cfg = RiskConfig { max_daily_drawdown_pct: 50.0, max_daily_loss_pct: 50.0, ..Default::default() };
        let g = RiskGate::new(cfg);
        for _ in 0..4 {
            g.record_close(-1.0);
        }
        assert!(!g.is_tripped());
        g.record_close(-1.0);
        assert!(g.is_tripped());
        assert!(g.trip_reason().unwrap().contains("consecutive"));
    }

    #[test]
    fn win_resets_consecutive_losses() {
        let cfg = RiskConfig { max_daily_drawdown_pct: 50.0, max_daily_loss_pct: 50.0, ..Default::default() };
        let g = RiskGate::new(cfg);
        for _ in 0..4 {
            g.record_close(-1.0);
        }
        g.record_close(2.0);
        for _ in 0..4 {
            g.record_close(-1.0);
        }
        assert!(!g.is_tripped());
    }

    #[test]
    fn daily_loss_trips_when_drawdown_limit_is_loose() {
        let cfg = RiskConfig { max_daily_drawdown_pct: 10.0, ..Default::default() };
        let g = RiskGate::new(cfg);
        g.record_close(-301.0);
        assert!(g.is_tripped());
        assert!(g.trip_reason().unwrap().contains("daily loss"));
    }

    #[test]
    fn reason_is_frozen_once_tripped() {
        let g = gate();
        g.record_close(-250.0);
        let first = g.trip_reason().unwrap();
        for _ in 0..6 {
            g.record_close(-10.0);
        }
        assert_eq!(g.trip_reason().unwrap(), first);
        // a profitable close does not un-trip
        g.record_close(1_000.0);
        assert!(g.is_tripped());
    }

    #[test]
    fn manual_reset_clears_trip_and_losses() {
        let g = gate();
        g.record_close(-250.0);
        assert!(g.is_tripped());
        g.reset(true);
        assert!(!g.is_tripped());
        assert_eq!(g.snapshot().consecutive_losses, 0);
        assert!(g.trip_reason().is_none());
    }

    #[test]
    fn day_rollover_resets_and_carries_balance() {
        let day = Arc::new(AtomicI64::new(0));
        let base = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let d = day.clone();
        let clock: DayClock = Arc::new(move || base + chrono::Duration::days(d.load(Ordering::SeqCst)));
        let g = RiskGate::with_clock(RiskConfig::default(), clock);

        g.record_close(-250.0);
        assert!(g.is_tripped());
        assert!(g.is_tripped(), "stays tripped within the day");

        day.store(1, Ordering::SeqCst);
        assert!(!g.is_tripped());
        let s = g.snapshot();
        assert_eq!(s.day, base + chrono::Duration::days(1));
        assert!((s.starting_balance - 9_750.0).abs() < 1e-9);
        assert!((s.peak_balance - 9_750.0).abs() < 1e-9);
        assert!(s.fills.is_empty());
    }

    #[test]
    fn validate_trade_scenario_passes() {
        let g = gate();
        assert!(g.validate_trade(&check(1.1000, 1.0950, 1.1150)).is_ok());
    }

    #[test]
    fn validate_trade_rejects_low_rr_for_any_levels() {
        let g = gate();
        let entries = [0.5, 1.1, 105.3, 2_000.0];
        let stops = [0.001, 0.01, 0.5, 3.0];
        let rrs = [0.1, 0.5, 1.0, 1.5, 1.99];
        for &e in &entries {
            for &s in &stops {
                for &rr in &rrs {
                    let buy = check(e, e - s * e / 10.0, e + rr * s * e / 10.0);
                    assert!(matches!(g.validate_trade(&buy), Err(RiskError::RiskReward { .. })));
                    let sell = check(e, e + s * e / 10.0, e - rr * s * e / 10.0);
                    let res = g.validate_trade(&sell);
                    assert!(res.is_err());
                }
            }
        }
    }

    #[test]
    fn validate_trade_rejects_size_levels_and_trip() {
        let g = gate();
        let mut c = check(1.1, 1.09, 1.13);
        c.size = 0.0;
        assert_eq!(g.validate_trade(&c), Err(RiskError::Size(0.0)));

        let wrong_side = TradeCheck { direction: Direction::Sell, entry: 1.1, stop_loss: 1.09, take_profit: 1.13, size: 0.1 };
        assert!(matches!(g.validate_trade(&wrong_side), Err(RiskError::Levels { .. })));

        g.record_close(-300.0);
        assert_eq!(g.validate_trade(&check(1.1, 1.09, 1.13)), Err(RiskError::Tripped));
    }

    #[test]
    fn position_size_from_risk_and_stop() {
        let g = gate();
        // 1% of 10_000 = 100; stop 0.005 * 100_000 = 500 per lot => 0.2
        assert!((g.position_size(1.1000, 1.0950) - 0.2).abs() < 1e-9);
        assert_eq!(g.position_size(1.1, 1.1), 0.0);
        // very wide stop rounds to zero
        assert_eq!(g.position_size(1.1, 0.1), 0.0);
    }

    #[test]
    fn initial_balance_rebases_the_day() {
        let g = gate();
        g.set_initial_balance(25_000.0);
        let s = g.snapshot();
        assert_eq!((s.starting_balance, s.current_balance, s.peak_balance), (25_000.0, 25_000.0, 25_000.0));
        // 2% of 25k is 500; 400 stays under the limit
        g.record_close(-400.0);
        assert!(!g.is_tripped());
    }

    #[test]
    fn daily_report_counts() {
        let g = gate();
        g.record_fill("EURUSD", Direction::Buy, 1.1, 0.1);
        g.record_close(30.0);
        g.record_close(-10.0);
        let r = g.daily_report();
        assert_eq!(r.fills, 1);
        assert_eq!(r.closes, 2);
        assert_eq!(r.wins, 1);
        assert_eq!(r.losses, 1);
        assert!((r.win_rate_pct - 50.0).abs() < 1e-9);
        assert!((r.daily_pnl - 20.0).abs() < 1e-9);
    }
}
