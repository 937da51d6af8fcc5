// ===============================
// src/gateway.rs (paper venue)
// ===============================
//
// In-process simulated broker:
// - random-walk mid price per symbol (seeded 150.0 for JPY quotes, 1.10 otherwise)
// - synthetic OHLCV history ending at the current price
// - fills after `fill_latency` with random slippage up to `max_slippage_pips`
// - stops/targets are checked on every price update; hits close the position
//   broker-side, the same way a real account would
//
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::domain::{pip_size, Candle, CloseResult, Direction, OrderRequest, OrderResult, Position, Timeframe};

#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub balance: f64,
    pub contract_size: f64,
    /// relative step of the random walk per price query
    pub volatility: f64,
    pub fill_latency: Duration,
    pub max_slippage_pips: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            balance: 10_000.0,
            contract_size: 100_000.0,
            volatility: 0.0005,
            fill_latency: Duration::from_millis(50),
            max_slippage_pips: 1.0,
        }
    }
}

struct Book {
    prices: HashMap<String, f64>,
    positions: BTreeMap<u64, Position>,
    next_ticket: u64,
    balance: f64,
}

pub struct PaperBroker {
    cfg: PaperConfig,
    connected: AtomicBool,
    book: Mutex<Book>,
}

fn seed_price(symbol: &str) -> f64 {
    if symbol.contains("JPY") { 150.0 } else { 1.10 }
}

fn floating(p: &Position, px: f64, contract_size: f64) -> f64 {
    (px - p.open_price) * p.direction.sign() * p.size * contract_size
}

impl PaperBroker {
    pub fn new(cfg: PaperConfig) -> Self {
        let balance = cfg.balance;
        Self {
            cfg,
            connected: AtomicBool::new(true),
            book: Mutex::new(Book { prices: HashMap::new(), positions: BTreeMap::new(), next_ticket: 1, balance }),
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) { Ok(()) } else { Err(BrokerError::Disconnected) }
    }

    /// Drops the session; every call fails with `Disconnected` until `reconnect`.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        warn!("paper broker: session dropped");
    }

    /// Forces the mid price and runs stop/target checks against it.
    pub fn set_price(&self, symbol: &str, px: f64) {
        let mut book = self.book();
        book.prices.insert(symbol.to_string(), px);
        self.mark(&mut book, symbol, px);
    }

    pub fn open_position_count(&self) -> usize {
        self.book().positions.len()
    }

    fn close_locked(&self, book: &mut Book, ticket: u64, px: f64) -> Option<CloseResult> {
        let pos = book.positions.remove(&ticket)?;
        let pnl = floating(&pos, px, self.cfg.contract_size);
        book.balance += pnl;
        Some(CloseResult { ticket, close_price: px, pnl })
    }

    // Updates floating P&L and closes positions whose stop or target was crossed.
    fn mark(&self, book: &mut Book, symbol: &str, px: f64) {
        let mut hit = Vec::new();
        for p in book.positions.values_mut().filter(|p| p.symbol == symbol) {
            p.current_price = px;
            p.profit = floating(p, px, self.cfg.contract_size);
            let (stop_hit, target_hit) = match p.direction {
                Direction::Buy => (px <= p.stop_loss, px >= p.take_profit),
                Direction::Sell => (px >= p.stop_loss, px <= p.take_profit),
            };
            if stop_hit || target_hit {
                hit.push((p.ticket, if stop_hit { p.stop_loss } else { p.take_profit }));
            }
        }
        for (ticket, level) in hit {
            if let Some(c) = self.close_locked(book, ticket, level) {
                info!(%symbol, ticket, pnl = c.pnl, "paper broker: level hit, position closed");
            }
        }
    }

    fn step(&self, symbol: &str) -> f64 {
        let mut book = self.book();
        let last = book.prices.get(symbol).copied().unwrap_or_else(|| seed_price(symbol));
        let next = if self.cfg.volatility > 0.0 {
            let r: f64 = rand::thread_rng().gen_range(-self.cfg.volatility..self.cfg.volatility);
            (last * (1.0 + r)).max(f64::EPSILON)
        } else {
            last
        };
        book.prices.insert(symbol.to_string(), next);
        self.mark(&mut book, symbol, next);
        next
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        info!("paper broker: session restored");
        Ok(())
    }

    async fn account_balance(&self) -> Result<f64, BrokerError> {
        self.ensure_connected()?;
        Ok(self.book().balance)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.ensure_connected()?;
        Ok(self.step(symbol))
    }

    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.ensure_connected()?;
        let last = self.book().prices.get(symbol).copied().unwrap_or_else(|| seed_price(symbol));
        let vol = self.cfg.volatility.max(1e-6);
        let mut rng = rand::thread_rng();
        let now = Utc::now();

        // walk backwards from the current price, then reverse into time order
        let mut out = Vec::with_capacity(count);
        let mut close = last;
        for i in 0..count {
            let open = (close * (1.0 + rng.gen_range(-vol..vol))).max(f64::EPSILON);
            let wick = close.max(open) * vol * rng.gen_range(0.0..1.0);
            out.push(Candle {
                ts: now - ChronoDuration::seconds(timeframe.seconds() * i as i64),
                open,
                high: close.max(open) + wick,
                low: (close.min(open) - wick).max(f64::EPSILON),
                close,
                volume: rng.gen_range(100.0..1_000.0),
            });
            close = open;
        }
        out.reverse();
        Ok(out)
    }

    async fn get_open_positions(&self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        self.ensure_connected()?;
        Ok(self.book().positions.values().filter(|p| p.symbol == symbol).cloned().collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, BrokerError> {
        self.ensure_connected()?;
        if !req.size.is_finite() || req.size <= 0.0 {
            return Err(BrokerError::Rejected(format!("invalid volume {}", req.size)));
        }
        sleep(self.cfg.fill_latency).await;
        self.ensure_connected()?;

        let mut book = self.book();
        let mid = book.prices.get(&req.symbol).copied().unwrap_or(req.price);
        let slip = if self.cfg.max_slippage_pips > 0.0 {
            rand::thread_rng().gen_range(0.0..self.cfg.max_slippage_pips) * pip_size(&req.symbol)
        } else {
            0.0
        };
        // slippage always goes against the order
        let executed_price = mid + slip * req.direction.sign();
        let ticket = book.next_ticket;
        book.next_ticket += 1;
        book.positions.insert(
            ticket,
            Position {
                ticket,
                symbol: req.symbol.clone(),
                direction: req.direction,
                size: req.size,
                open_price: executed_price,
                current_price: mid,
                stop_loss: req.stop_loss,
                take_profit: req.take_profit,
                profit: 0.0,
                opened_at: Utc::now(),
            },
        );
        debug!(symbol = %req.symbol, ticket, executed_price, size = req.size, "paper broker: filled");
        Ok(OrderResult { ticket, executed_price, size: req.size })
    }

    async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let mut book = self.book();
        let pos = book.positions.get_mut(&ticket).ok_or(BrokerError::UnknownTicket(ticket))?;
        if let Some(sl) = sl {
            pos.stop_loss = sl;
        }
        if let Some(tp) = tp {
            pos.take_profit = tp;
        }
        Ok(())
    }

    async fn close_position(&self, ticket: u64) -> Result<CloseResult, BrokerError> {
        self.ensure_connected()?;
        let mut book = self.book();
        let px = match book.positions.get(&ticket) {
            Some(p) => book.prices.get(&p.symbol).copied().unwrap_or(p.current_price),
            None => return Err(BrokerError::UnknownTicket(ticket)),
        };
        self.close_locked(&mut book, ticket, px).ok_or(BrokerError::UnknownTicket(ticket))
    }
}
