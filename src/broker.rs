// ===============================
// src/broker.rs
// ===============================
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::{Candle, CloseResult, OrderRequest, OrderResult, Position, Timeframe};

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerError {
    #[error("broker session disconnected")]
    Disconnected,
    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unknown ticket {0}")]
    UnknownTicket(u64),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Exchange/broker session. Every call may fail transiently; callers bound each
/// call with `call_timeout()`.
#[async_trait]
pub trait Broker: Send + Sync {
    fn call_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn is_connected(&self) -> bool;

    async fn reconnect(&self) -> Result<(), BrokerError>;

    async fn account_balance(&self) -> Result<f64, BrokerError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError>;

    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError>;

    async fn get_open_positions(&self, symbol: &str) -> Result<Vec<Position>, BrokerError>;

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, BrokerError>;

    async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<(), BrokerError>;

    async fn close_position(&self, ticket: u64) -> Result<CloseResult, BrokerError>;
}

/// Runs `fut` under the broker's own timeout, mapping elapsed into `BrokerError::Timeout`.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, BrokerError>
where
    F: std::future::Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(BrokerError::Timeout(limit)),
    }
}

/// Serializes the request/response exchange of order-path calls over one
/// underlying connection. Read-only queries pass straight through.
pub struct SerializedBroker<B> {
    inner: B,
    exchange: Mutex<()>,
}

impl<B: Broker> SerializedBroker<B> {
    pub fn new(inner: B) -> Self {
        Self { inner, exchange: Mutex::new(()) }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: Broker> Broker for SerializedBroker<B> {
    fn call_timeout(&self) -> Duration {
        self.inner.call_timeout()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let _guard = self.exchange.lock().await;
        self.inner.reconnect().await
    }

    async fn account_balance(&self) -> Result<f64, BrokerError> {
        self.inner.account_balance().await
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.inner.get_current_price(symbol).await
    }

    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.inner.get_historical_candles(symbol, timeframe, count).await
    }

    async fn get_open_positions(&self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        self.inner.get_open_positions(symbol).await
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, BrokerError> {
        let _guard = self.exchange.lock().await;
        self.inner.place_order(req).await
    }

    async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<(), BrokerError> {
        let _guard = self.exchange.lock().await;
        self.inner.modify_position(ticket, sl, tp).await
    }

    async fn close_position(&self, ticket: u64) -> Result<CloseResult, BrokerError> {
        let _guard = self.exchange.lock().await;
        self.inner.close_position(ticket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::ScriptedBroker;
    use std::sync::Arc;

    #[tokio::test]
    async fn order_path_is_serialized() {
        let inner = ScriptedBroker::new();
        inner.set_order_latency(Duration::from_millis(20));
        let broker = Arc::new(SerializedBroker::new(inner));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let b = broker.clone();
            tasks.push(tokio::spawn(async move { b.place_order(&crate::testkit::order("EURUSD")).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(broker.inner().max_concurrent_orders(), 1);
        assert_eq!(broker.inner().orders_placed(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_maps_elapsed_to_timeout() {
        let res: Result<(), BrokerError> = bounded(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(res, Err(BrokerError::Timeout(Duration::from_secs(1))));
    }
}
