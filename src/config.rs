// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : fleet_bot_rust - per-symbol autonomous trading fleet control plane
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Runs one decide-and-act worker per symbol, gates every trade
          through a shared drawdown circuit breaker, executes through a
          serialized broker session, supervises worker health, exposes
          Prometheus metrics, and records JSONL events.
=============================================================================
*/
use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Timeframe;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("no symbols configured")]
    NoSymbols,
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { key, reason: reason.into() }
}

fn ensure_pct(key: &'static str, v: f64) -> Result<(), ConfigError> {
    if !v.is_finite() || v <= 0.0 || v > 100.0 {
        return Err(invalid(key, format!("{v} not in (0, 100]")));
    }
    Ok(())
}

fn ensure_unit(key: &'static str, v: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&v) {
        return Err(invalid(key, format!("{v} not in [0, 1]")));
    }
    Ok(())
}

fn ensure_nonzero(key: &'static str, d: Duration) -> Result<(), ConfigError> {
    if d.is_zero() {
        return Err(invalid(key, "must be > 0"));
    }
    Ok(())
}

// ===== Risk gate =====
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskConfig {
    pub starting_balance: f64,
    pub max_daily_drawdown_pct: f64,
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub min_risk_reward: f64,
    /// share of balance risked per trade, percent
    pub risk_per_trade_pct: f64,
    /// units per 1.0 lot
    pub contract_size: f64,
    pub lot_step: f64,
    pub max_lot: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            starting_balance: 10_000.0,
            max_daily_drawdown_pct: 2.0,
            max_daily_loss_pct: 3.0,
            max_consecutive_losses: 5,
            min_risk_reward: 2.0,
            risk_per_trade_pct: 1.0,
            contract_size: 100_000.0,
            lot_step: 0.01,
            max_lot: 10.0,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.starting_balance.is_finite() || self.starting_balance <= 0.0 {
            return Err(invalid("STARTING_BALANCE", "must be > 0"));
        }
        ensure_pct("MAX_DAILY_DRAWDOWN_PCT", self.max_daily_drawdown_pct)?;
        ensure_pct("MAX_DAILY_LOSS_PCT", self.max_daily_loss_pct)?;
        ensure_pct("RISK_PER_TRADE_PCT", self.risk_per_trade_pct)?;
        if self.max_consecutive_losses == 0 {
            return Err(invalid("MAX_CONSECUTIVE_LOSSES", "must be >= 1"));
        }
        if !self.min_risk_reward.is_finite() || self.min_risk_reward < 0.0 {
            return Err(invalid("MIN_RISK_REWARD", "must be >= 0"));
        }
        if self.contract_size <= 0.0 || self.lot_step <= 0.0 || self.max_lot < self.lot_step {
            return Err(invalid("LOT_STEP", "contract size, lot step and max lot must be positive and consistent"));
        }
        Ok(())
    }
}

// ===== Execution pipeline =====
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub auto_execute_threshold: f64,
    pub max_slippage_pips: f64,
    /// size used for pre-trade validation when the signal carries none
    pub validation_size: f64,
    pub magic_number: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { auto_execute_threshold: 0.85, max_slippage_pips: 3.0, validation_size: 0.01, magic_number: 123_456 }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_unit("AUTO_EXECUTE_THRESHOLD", self.auto_execute_threshold)?;
        if self.max_slippage_pips < 0.0 {
            return Err(invalid("MAX_SLIPPAGE_PIPS", "must be >= 0"));
        }
        if self.validation_size <= 0.0 {
            return Err(invalid("VALIDATION_SIZE", "must be > 0"));
        }
        Ok(())
    }
}

// ===== Worker =====
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tick_interval: Duration,
    pub breaker_cooldown: Duration,
    pub min_confidence: f64,
    pub max_daily_trades: u32,
    pub max_consecutive_errors: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub timeframe: Timeframe,
    pub candle_count: usize,
    pub min_candles: usize,
    /// tick-to-tick move (percent) that raises a price alert
    pub price_alert_pct: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            breaker_cooldown: Duration::from_secs(300),
            min_confidence: 0.85,
            max_daily_trades: 5,
            max_consecutive_errors: 5,
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(300),
            timeframe: Timeframe::M5,
            candle_count: 200,
            min_candles: 100,
            price_alert_pct: 0.5,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_nonzero("TICK_INTERVAL_SECS", self.tick_interval)?;
        ensure_nonzero("BREAKER_COOLDOWN_SECS", self.breaker_cooldown)?;
        ensure_nonzero("BACKOFF_BASE_SECS", self.backoff_base)?;
        if self.backoff_max < self.backoff_base {
            return Err(invalid("BACKOFF_MAX_SECS", "must be >= backoff base"));
        }
        ensure_unit("MIN_CONFIDENCE", self.min_confidence)?;
        if self.max_consecutive_errors == 0 {
            return Err(invalid("MAX_CONSECUTIVE_ERRORS", "must be >= 1"));
        }
        if self.candle_count == 0 || self.min_candles > self.candle_count {
            return Err(invalid("MIN_CANDLES", "must not exceed candle count"));
        }
        if self.price_alert_pct <= 0.0 {
            return Err(invalid("PRICE_ALERT_PCT", "must be > 0"));
        }
        Ok(())
    }

    /// Backoff after `errors` consecutive failures: min(max, base * 2^errors).
    pub fn backoff_for(&self, errors: u32) -> Duration {
        let factor = 1u32.checked_shl(errors.min(31)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    pub fn apply(&self, patch: &WorkerConfigPatch) -> Result<WorkerConfig, ConfigError> {
        let mut next = self.clone();
        if let Some(s) = patch.tick_interval_secs { next.tick_interval = Duration::from_secs(s); }
        if let Some(s) = patch.breaker_cooldown_secs { next.breaker_cooldown = Duration::from_secs(s); }
        if let Some(v) = patch.min_confidence { next.min_confidence = v; }
        if let Some(v) = patch.max_daily_trades { next.max_daily_trades = v; }
        if let Some(v) = patch.max_consecutive_errors { next.max_consecutive_errors = v; }
        if let Some(s) = patch.backoff_base_secs { next.backoff_base = Duration::from_secs(s); }
        if let Some(s) = patch.backoff_max_secs { next.backoff_max = Duration::from_secs(s); }
        if let Some(tf) = patch.timeframe { next.timeframe = tf; }
        if let Some(v) = patch.candle_count { next.candle_count = v; }
        if let Some(v) = patch.min_candles { next.min_candles = v; }
        if let Some(v) = patch.price_alert_pct { next.price_alert_pct = v; }
        next.validate()?;
        Ok(next)
    }
}

/// Partial worker configuration for `UpdateConfig`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerConfigPatch {
    pub tick_interval_secs: Option<u64>,
    pub breaker_cooldown_secs: Option<u64>,
    pub min_confidence: Option<f64>,
    pub max_daily_trades: Option<u32>,
    pub max_consecutive_errors: Option<u32>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    pub timeframe: Option<Timeframe>,
    pub candle_count: Option<usize>,
    pub min_candles: Option<usize>,
    pub price_alert_pct: Option<f64>,
}

// ===== Fleet / supervisor =====
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FleetConfig {
    pub max_workers: usize,
}

impl Default for FleetConfig {
    fn default() -> Self { Self { max_workers: 10 } }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(invalid("MAX_WORKERS", "must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub interval: Duration,
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), restart_delay: Duration::from_secs(2) }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_nonzero("HEARTBEAT_INTERVAL_SECS", self.interval)
    }
}

// ===== Signal generation / trade management =====
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyMode {
    MeanReversion,
    VolBreakout,
}

impl StrategyMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean_reversion" | "meanreversion" | "mr" => Some(StrategyMode::MeanReversion),
            "vol_breakout" | "volbreakout" | "vb" => Some(StrategyMode::VolBreakout),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyMode::MeanReversion => "mean_reversion",
            StrategyMode::VolBreakout => "vol_breakout",
        }
    }
}

// ===== App =====
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub symbols: Vec<String>,
    pub metrics_port: u16,
    pub record_file: Option<String>,
    pub strategy: StrategyMode,
    /// close positions held longer than this; None keeps them until SL/TP
    pub max_hold: Option<Duration>,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub worker: WorkerConfig,
    pub fleet: FleetConfig,
    pub supervisor: SupervisorConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        self.risk.validate()?;
        self.execution.validate()?;
        self.worker.validate()?;
        self.fleet.validate()?;
        self.supervisor.validate()
    }
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| invalid(key, format!("cannot parse {raw:?}"))),
        _ => Ok(default),
    }
}

fn env_secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = raw
        .split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect();
    out.dedup();
    out
}

/// Load from environment (and `.env`), falling back to defaults, then validate once.
pub fn load() -> Result<AppConfig, ConfigError> {
    let _ = dotenv();

    // SYMBOLS=EURUSD,GBPUSD,USDJPY
    let symbols = env::var("SYMBOLS")
        .ok()
        .map(|s| parse_symbols(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec!["EURUSD".to_string()]);

    let record_file = env::var("RECORD_FILE").ok().filter(|s| !s.trim().is_empty());
    let metrics_port = env_or("METRICS_PORT", 9898u16)?;
    let strategy = match env::var("STRATEGY") {
        Ok(raw) => StrategyMode::parse(&raw).ok_or_else(|| invalid("STRATEGY", raw))?,
        Err(_) => StrategyMode::MeanReversion,
    };
    // MAX_HOLD_SECS=0 (default) disables the time-based exit
    let max_hold = Some(env_secs("MAX_HOLD_SECS", Duration::ZERO)?).filter(|d| !d.is_zero());

    let d = RiskConfig::default();
    let risk = RiskConfig {
        starting_balance: env_or("STARTING_BALANCE", d.starting_balance)?,
        max_daily_drawdown_pct: env_or("MAX_DAILY_DRAWDOWN_PCT", d.max_daily_drawdown_pct)?,
        max_daily_loss_pct: env_or("MAX_DAILY_LOSS_PCT", d.max_daily_loss_pct)?,
        max_consecutive_losses: env_or("MAX_CONSECUTIVE_LOSSES", d.max_consecutive_losses)?,
        min_risk_reward: env_or("MIN_RISK_REWARD", d.min_risk_reward)?,
        risk_per_trade_pct: env_or("RISK_PER_TRADE_PCT", d.risk_per_trade_pct)?,
        contract_size: env_or("CONTRACT_SIZE", d.contract_size)?,
        lot_step: env_or("LOT_STEP", d.lot_step)?,
        max_lot: env_or("MAX_LOT", d.max_lot)?,
    };

    let d = ExecutionConfig::default();
    let execution = ExecutionConfig {
        auto_execute_threshold: env_or("AUTO_EXECUTE_THRESHOLD", d.auto_execute_threshold)?,
        max_slippage_pips: env_or("MAX_SLIPPAGE_PIPS", d.max_slippage_pips)?,
        validation_size: env_or("VALIDATION_SIZE", d.validation_size)?,
        magic_number: env_or("MAGIC_NUMBER", d.magic_number)?,
    };

    let d = WorkerConfig::default();
    let timeframe = match env::var("TIMEFRAME") {
        Ok(raw) => Timeframe::parse(&raw).ok_or_else(|| invalid("TIMEFRAME", raw))?,
        Err(_) => d.timeframe,
    };
    let worker = WorkerConfig {
        tick_interval: env_secs("TICK_INTERVAL_SECS", d.tick_interval)?,
        breaker_cooldown: env_secs("BREAKER_COOLDOWN_SECS", d.breaker_cooldown)?,
        min_confidence: env_or("MIN_CONFIDENCE", d.min_confidence)?,
        max_daily_trades: env_or("MAX_DAILY_TRADES", d.max_daily_trades)?,
        max_consecutive_errors: env_or("MAX_CONSECUTIVE_ERRORS", d.max_consecutive_errors)?,
        backoff_base: env_secs("BACKOFF_BASE_SECS", d.backoff_base)?,
        backoff_max: env_secs("BACKOFF_MAX_SECS", d.backoff_max)?,
        timeframe,
        candle_count: env_or("CANDLE_COUNT", d.candle_count)?,
        min_candles: env_or("MIN_CANDLES", d.min_candles)?,
        price_alert_pct: env_or("PRICE_ALERT_PCT", d.price_alert_pct)?,
    };

    let fleet = FleetConfig { max_workers: env_or("MAX_WORKERS", FleetConfig::default().max_workers)? };

    let d = SupervisorConfig::default();
    let supervisor = SupervisorConfig {
        interval: env_secs("HEARTBEAT_INTERVAL_SECS", d.interval)?,
        restart_delay: env_secs("RESTART_DELAY_SECS", d.restart_delay)?,
    };

    let cfg = AppConfig {
        symbols,
        metrics_port,
        record_file,
        strategy,
        max_hold,
        risk,
        execution,
        worker,
        fleet,
        supervisor,
    };
    cfg.validate()?;
    Ok(cfg)
}
