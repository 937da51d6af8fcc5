// ===============================
// src/testkit.rs
// ===============================
//
// Scripted collaborators for unit tests.
//
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::broker::{Broker, BrokerError};
use crate::domain::{
    Candle, CloseResult, Direction, OrderRequest, OrderResult, Position, Sentiment, SignalError, Timeframe,
    TradingSignal,
};
use crate::signal::SignalGenerator;

/// BUY 1.1000 / SL 1.0950 / TP 1.1150 (risk/reward 3.0).
pub fn signal(symbol: &str, confidence: f64) -> TradingSignal {
    TradingSignal::new(symbol, Direction::Buy, confidence, 1.1000, 1.0950, 1.1150).unwrap()
}

pub fn order(symbol: &str) -> OrderRequest {
    OrderRequest {
        symbol: symbol.to_string(),
        direction: Direction::Buy,
        size: 0.1,
        price: 1.1,
        stop_loss: 1.09,
        take_profit: 1.13,
        comment: "test".into(),
        magic: 1,
    }
}

pub fn position(ticket: u64, symbol: &str, direction: Direction, profit: f64) -> Position {
    Position {
        ticket,
        symbol: symbol.to_string(),
        direction,
        size: 0.1,
        open_price: 1.1,
        current_price: 1.1,
        stop_loss: if direction == Direction::Buy { 1.09 } else { 1.11 },
        take_profit: if direction == Direction::Buy { 1.13 } else { 1.07 },
        profit,
        opened_at: Utc::now(),
    }
}

type CloseHook = Arc<dyn Fn(u64) + Send + Sync>;

struct Script {
    price: f64,
    candle_count: usize,
    fill_offset: f64,
    order_latency: Duration,
    reject: Option<String>,
    fail_prices: usize,
    fail_closes: bool,
    positions: BTreeMap<u64, Position>,
    next_ticket: u64,
    on_close: Option<CloseHook>,
}

pub struct ScriptedBroker {
    connected: AtomicBool,
    script: Mutex<Script>,
    orders: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    price_calls: AtomicUsize,
    closes: AtomicUsize,
    reconnects: AtomicUsize,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            script: Mutex::new(Script {
                price: 1.1,
                candle_count: 200,
                fill_offset: 0.0,
                order_latency: Duration::ZERO,
                reject: None,
                fail_prices: 0,
                fail_closes: false,
                positions: BTreeMap::new(),
                next_ticket: 1_000,
                on_close: None,
            }),
            orders: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            price_calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::SeqCst);
    }
    pub fn set_price(&self, px: f64) {
        self.script().price = px;
    }
    pub fn set_candle_count(&self, n: usize) {
        self.script().candle_count = n;
    }
    pub fn set_fill_offset(&self, offset: f64) {
        self.script().fill_offset = offset;
    }
    pub fn set_order_latency(&self, d: Duration) {
        self.script().order_latency = d;
    }
    pub fn reject_orders(&self, reason: &str) {
        self.script().reject = Some(reason.to_string());
    }
    /// The next `n` price queries fail.
    pub fn fail_prices(&self, n: usize) {
        self.script().fail_prices = n;
    }
    pub fn fail_closes(&self, fail: bool) {
        self.script().fail_closes = fail;
    }
    pub fn add_position(&self, p: Position) {
        self.script().positions.insert(p.ticket, p);
    }
    /// Simulates a stop/target hit on the broker side.
    pub fn remove_position(&self, ticket: u64) {
        self.script().positions.remove(&ticket);
    }
    pub fn set_position_profit(&self, ticket: u64, profit: f64) {
        if let Some(p) = self.script().positions.get_mut(&ticket) {
            p.profit = profit;
        }
    }
    pub fn on_close(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        self.script().on_close = Some(Arc::new(hook));
    }

    pub fn orders_placed(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }
    pub fn max_concurrent_orders(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
    pub fn price_calls(&self) -> usize {
        self.price_calls.load(Ordering::SeqCst)
    }
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.set_connected(true);
        Ok(())
    }

    async fn account_balance(&self) -> Result<f64, BrokerError> {
        Ok(10_000.0)
    }

    async fn get_current_price(&self, _symbol: &str) -> Result<f64, BrokerError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        let mut s = self.script();
        if s.fail_prices > 0 {
            s.fail_prices = s.fail_prices.saturating_sub(1);
            return Err(BrokerError::Transport("scripted price failure".into()));
        }
        Ok(s.price)
    }

    async fn get_historical_candles(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        let s = self.script();
        let n = s.candle_count.min(count);
        let now = Utc::now();
        Ok((0..n)
            .map(|i| Candle {
                ts: now - chrono::Duration::seconds(timeframe.seconds() * (n - i) as i64),
                open: s.price,
                high: s.price + 0.0005,
                low: s.price - 0.0005,
                close: s.price,
                volume: 1.0,
            })
            .collect())
    }

    async fn get_open_positions(&self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        Ok(self.script().positions.values().filter(|p| p.symbol == symbol).cloned().collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, BrokerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = self.script().order_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut s = self.script();
        if let Some(reason) = &s.reject {
            return Err(BrokerError::Rejected(reason.clone()));
        }
        self.orders.fetch_add(1, Ordering::SeqCst);
        let ticket = s.next_ticket;
        s.next_ticket += 1;
        let price = s.price;
        let executed_price = price + s.fill_offset;
        s.positions.insert(
            ticket,
            Position {
                ticket,
                symbol: req.symbol.clone(),
                direction: req.direction,
                size: req.size,
                open_price: executed_price,
                current_price: price,
                stop_loss: req.stop_loss,
                take_profit: req.take_profit,
                profit: 0.0,
                opened_at: Utc::now(),
            },
        );
        Ok(OrderResult { ticket, executed_price, size: req.size })
    }

    async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<(), BrokerError> {
        let mut s = self.script();
        let p = s.positions.get_mut(&ticket).ok_or(BrokerError::UnknownTicket(ticket))?;
        if let Some(sl) = sl {
            p.stop_loss = sl;
        }
        if let Some(tp) = tp {
            p.take_profit = tp;
        }
        Ok(())
    }

    async fn close_position(&self, ticket: u64) -> Result<CloseResult, BrokerError> {
        let hook = {
            let s = self.script();
            if s.fail_closes {
                return Err(BrokerError::Rejected("scripted close failure".into()));
            }
            s.on_close.clone()
        };
        if let Some(hook) = hook {
            hook(ticket);
        }
        let mut s = self.script();
        let p = s.positions.remove(&ticket).ok_or(BrokerError::UnknownTicket(ticket))?;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(CloseResult { ticket, close_price: s.price, pnl: p.profit })
    }
}

enum Fallback {
    Nothing,
    Always(TradingSignal),
}

/// Pops scripted results first, then falls back to a fixed answer.
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<Result<Option<TradingSignal>, SignalError>>>,
    fallback: Fallback,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn none() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), fallback: Fallback::Nothing, calls: AtomicUsize::new(0) }
    }

    pub fn always(signal: TradingSignal) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), fallback: Fallback::Always(signal), calls: AtomicUsize::new(0) }
    }

    pub fn push(&self, res: Result<Option<TradingSignal>, SignalError>) {
        self.queue.lock().unwrap().push_back(res);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalGenerator for ScriptedGenerator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate_signal(
        &self,
        _symbol: &str,
        _candles: &[Candle],
        _sentiment: Option<&Sentiment>,
    ) -> Result<Option<TradingSignal>, SignalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(res) = self.queue.lock().unwrap().pop_front() {
            return res;
        }
        Ok(match &self.fallback {
            Fallback::Nothing => None,
            Fallback::Always(s) => Some(s.clone()),
        })
    }
}
