// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction { Buy, Sell }

impl Direction {
    pub fn sign(&self) -> f64 { match self { Direction::Buy => 1.0, Direction::Sell => -1.0 } }
    pub fn as_str(&self) -> &'static str { match self { Direction::Buy => "BUY", Direction::Sell => "SELL" } }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe { M1, M5, M15, M30, H1, H4, D1 }

impl Timeframe {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "M1" | "1M" => Some(Timeframe::M1),
            "M5" | "5M" => Some(Timeframe::M5),
            "M15" | "15M" => Some(Timeframe::M15),
            "M30" | "30M" => Some(Timeframe::M30),
            "H1" | "1H" => Some(Timeframe::H1),
            "H4" | "4H" => Some(Timeframe::H4),
            "D1" | "1D" => Some(Timeframe::D1),
            _ => None,
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle { pub ts: DateTime<Utc>, pub open: f64, pub high: f64, pub low: f64, pub close: f64, pub volume: f64 }

/// Optional context handed to signal generators. The control plane never builds one itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sentiment { pub score: f64, pub source: String }

#[derive(Debug, Error, PartialEq)]
pub enum SignalError {
    #[error("confidence {0} outside [0, 1]")]
    Confidence(f64),
    #[error("non-finite or non-positive price level")]
    PriceLevel,
    #[error("stop loss equals entry")]
    ZeroStopDistance,
    #[error("generator failed: {0}")]
    Generator(String),
}

/// Candidate trade produced by a `SignalGenerator`. Fields are read-only once built,
/// and a deserialized signal passes the same checks as `TradingSignal::new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "SignalFields")]
pub struct TradingSignal {
    symbol: String,
    direction: Direction,
    confidence: f64,
    entry: f64,
    stop_loss: f64,
    take_profit: f64,
    size: Option<f64>,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct SignalFields {
    symbol: String,
    direction: Direction,
    confidence: f64,
    entry: f64,
    stop_loss: f64,
    take_profit: f64,
    #[serde(default)]
    size: Option<f64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SignalFields> for TradingSignal {
    type Error = SignalError;

    fn try_from(f: SignalFields) -> Result<Self, SignalError> {
        let mut sig = TradingSignal::new(f.symbol, f.direction, f.confidence, f.entry, f.stop_loss, f.take_profit)?;
        sig.size = f.size;
        sig.created_at = f.created_at;
        Ok(sig)
    }
}

impl TradingSignal {
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        confidence: f64,
        entry: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<Self, SignalError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(SignalError::Confidence(confidence));
        }
        for px in [entry, stop_loss, take_profit] {
            if !px.is_finite() || px <= 0.0 {
                return Err(SignalError::PriceLevel);
            }
        }
        if entry == stop_loss {
            return Err(SignalError::ZeroStopDistance);
        }
        Ok(Self {
            symbol: symbol.into(),
            direction,
            confidence,
            entry,
            stop_loss,
            take_profit,
            size: None,
            created_at: Utc::now(),
        })
    }

    pub fn with_size(mut self, size: f64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn symbol(&self) -> &str { &self.symbol }
    pub fn direction(&self) -> Direction { self.direction }
    pub fn confidence(&self) -> f64 { self.confidence }
    pub fn entry(&self) -> f64 { self.entry }
    pub fn stop_loss(&self) -> f64 { self.stop_loss }
    pub fn take_profit(&self) -> f64 { self.take_profit }
    pub fn size(&self) -> Option<f64> { self.size }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }

    /// |take_profit - entry| / |entry - stop_loss|
    pub fn risk_reward(&self) -> f64 {
        risk_reward(self.entry, self.stop_loss, self.take_profit)
    }
}

pub fn risk_reward(entry: f64, stop_loss: f64, take_profit: f64) -> f64 {
    let risk = (entry - stop_loss).abs();
    if risk == 0.0 {
        return 0.0;
    }
    (take_profit - entry).abs() / risk
}

/// Pip size: 0.01 for JPY-quoted pairs, 0.0001 otherwise.
pub fn pip_size(symbol: &str) -> f64 {
    if symbol.to_ascii_uppercase().contains("JPY") { 0.01 } else { 0.0001 }
}

// Broker-facing structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub comment: String,
    pub magic: u64,
}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult { pub ticket: u64, pub executed_price: f64, pub size: f64 }
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResult { pub ticket: u64, pub close_price: f64, pub pnl: f64 }
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub profit: f64,
    pub opened_at: DateTime<Utc>,
}

/// Worker-side record of a position it opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub ticket: u64,
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size: f64,
    pub opened_at: DateTime<Utc>,
    /// last floating P&L seen at the broker
    pub last_profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub symbol: String,
    pub ticket: Option<u64>,
    pub executed_price: Option<f64>,
    pub size: Option<f64>,
    pub slippage: Option<f64>,
    pub slippage_pips: Option<f64>,
    pub failure: Option<ExecutionError>,
    pub at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn rejected(symbol: &str, err: ExecutionError) -> Self {
        Self {
            success: false,
            symbol: symbol.to_string(),
            ticket: None,
            executed_price: None,
            size: None,
            slippage: None,
            slippage_pips: None,
            failure: Some(err),
            at: Utc::now(),
        }
    }
}

// Recorder events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Signal(TradingSignal),
    Execution(ExecutionOutcome),
    Breaker { reason: String, balance: f64, at: DateTime<Utc> },
    WorkerStatus { symbol: String, status: String, at: DateTime<Utc> },
    Close { symbol: String, ticket: u64, pnl: f64, at: DateTime<Utc> },
    Note { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialized_signal_is_validated() {
        let sig = TradingSignal::new("EURUSD", Direction::Sell, 0.9, 1.1000, 1.1050, 1.0850).unwrap().with_size(0.3);
        let back: TradingSignal = serde_json::from_str(&serde_json::to_string(&sig).unwrap()).unwrap();
        assert_eq!(back.symbol(), "EURUSD");
        assert_eq!(back.size(), Some(0.3));
        assert_eq!(back.created_at(), sig.created_at());

        let forged = r#"{"symbol":"EURUSD","direction":"BUY","confidence":1.5,"entry":1.1,"stop_loss":1.09,"take_profit":1.13,"created_at":"2026-05-04T10:00:00Z"}"#;
        let err = serde_json::from_str::<TradingSignal>(forged).unwrap_err();
        assert!(err.to_string().contains("confidence 1.5"));
        let flat = forged.replace("\"confidence\":1.5", "\"confidence\":0.9").replace("\"stop_loss\":1.09", "\"stop_loss\":1.1");
        assert!(serde_json::from_str::<TradingSignal>(&flat).is_err());
    }

    #[test]
    fn risk_reward_matches_hand_computation() {
        let sig = TradingSignal::new("EURUSD", Direction::Buy, 0.9, 1.1000, 1.0950, 1.1150).unwrap();
        assert!((sig.risk_reward() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn signal_rejects_bad_confidence_and_levels() {
        assert_eq!(
            TradingSignal::new("EURUSD", Direction::Buy, 1.2, 1.1, 1.0, 1.3).unwrap_err(),
            SignalError::Confidence(1.2)
        );
        assert_eq!(
            TradingSignal::new("EURUSD", Direction::Buy, 0.9, 1.1, 1.1, 1.3).unwrap_err(),
            SignalError::ZeroStopDistance
        );
        assert_eq!(
            TradingSignal::new("EURUSD", Direction::Sell, 0.9, f64::NAN, 1.1, 1.0).unwrap_err(),
            SignalError::PriceLevel
        );
    }

    #[test]
    fn pip_size_depends_on_quote() {
        assert_eq!(pip_size("USDJPY"), 0.01);
        assert_eq!(pip_size("eurjpy"), 0.01);
        assert_eq!(pip_size("EURUSD"), 0.0001);
    }

    #[test]
    fn timeframe_parse() {
        assert_eq!(Timeframe::parse("m5"), Some(Timeframe::M5));
        assert_eq!(Timeframe::parse("1h"), Some(Timeframe::H1));
        assert_eq!(Timeframe::parse("weekly"), None);
    }
}
