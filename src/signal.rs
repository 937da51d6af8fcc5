// ===============================
// src/signal.rs
// ===============================
//
// Seams to the collaborators that decide *what* to trade:
// - SignalGenerator : candles (+ optional sentiment) -> optional TradingSignal
// - TradeManagement : per-position adjustments while a position is open
//
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Candle, Position, Sentiment, SignalError, TradingSignal};

#[async_trait]
pub trait SignalGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// `Ok(None)` means no opportunity, which is not an error.
    async fn generate_signal(
        &self,
        symbol: &str,
        candles: &[Candle],
        sentiment: Option<&Sentiment>,
    ) -> Result<Option<TradingSignal>, SignalError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopUpdate {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Hooks applied to every open position on each worker tick.
#[async_trait]
pub trait TradeManagement: Send + Sync {
    fn name(&self) -> &'static str;

    /// New SL/TP for the position, if any.
    async fn trailing_stop(&self, position: &Position) -> Option<StopUpdate>;

    /// Reason to close the position now, if any.
    async fn exit_reason(&self, position: &Position, now: DateTime<Utc>) -> Option<String>;
}

/// Leaves every position alone. Trailing stops and discretionary exits are
/// not implemented; this makes that explicit.
pub struct NoTradeManagement;

#[async_trait]
impl TradeManagement for NoTradeManagement {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn trailing_stop(&self, _position: &Position) -> Option<StopUpdate> {
        None
    }

    async fn exit_reason(&self, _position: &Position, _now: DateTime<Utc>) -> Option<String> {
        None
    }
}

/// Closes positions held longer than `max_hold`.
pub struct TimeBasedExit {
    pub max_hold: Duration,
}

#[async_trait]
impl TradeManagement for TimeBasedExit {
    fn name(&self) -> &'static str {
        "time_based_exit"
    }

    async fn trailing_stop(&self, _position: &Position) -> Option<StopUpdate> {
        None
    }

    async fn exit_reason(&self, position: &Position, now: DateTime<Utc>) -> Option<String> {
        let held = now.signed_duration_since(position.opened_at).to_std().ok()?;
        (held > self.max_hold).then(|| format!("held {}s > {}s", held.as_secs(), self.max_hold.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;

    fn position(opened_secs_ago: i64) -> Position {
        Position {
            ticket: 7,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            size: 0.1,
            open_price: 1.1,
            current_price: 1.1,
            stop_loss: 1.09,
            take_profit: 1.13,
            profit: 0.0,
            opened_at: Utc::now() - chrono::Duration::seconds(opened_secs_ago),
        }
    }

    #[tokio::test]
    async fn noop_management_does_nothing() {
        let m = NoTradeManagement;
        assert!(m.trailing_stop(&position(10)).await.is_none());
        assert!(m.exit_reason(&position(1_000_000), Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn time_exit_fires_after_max_hold() {
        let m = TimeBasedExit { max_hold: Duration::from_secs(3_600) };
        assert!(m.exit_reason(&position(60), Utc::now()).await.is_none());
        assert!(m.exit_reason(&position(7_200), Utc::now()).await.is_some());
    }
}
