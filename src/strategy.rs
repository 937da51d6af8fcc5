// ===============================
// src/strategy.rs
// ===============================
//
// Reference signal generators over closed candles:
// 1) Mean-Reversion (default) -> MeanReversion
// 2) Volatility Breakout       -> VolBreakout
//
// Both size stops from the average candle range and set the target at
// `reward_multiple` times the stop distance. Confidence grows with how far
// price sits beyond the trigger level.
//
use async_trait::async_trait;

use crate::domain::{Candle, Direction, Sentiment, SignalError, TradingSignal};
use crate::metrics::SIGNALS_BY;
use crate::signal::SignalGenerator;

fn sma(values: impl Iterator<Item = f64>, n: usize) -> Option<f64> {
    if n == 0 {
        return None;
    }
    let sum: f64 = values.sum();
    Some(sum / n as f64)
}

fn avg_range(candles: &[Candle]) -> Option<f64> {
    sma(candles.iter().map(|c| c.high - c.low), candles.len()).filter(|r| *r > 0.0)
}

fn confidence(excess_ratio: f64, base: f64) -> f64 {
    (base + (1.0 - base) * (excess_ratio / (1.0 + excess_ratio))).clamp(0.0, 1.0)
}

fn build(
    symbol: &str,
    direction: Direction,
    conf: f64,
    entry: f64,
    stop_distance: f64,
    reward_multiple: f64,
) -> Result<Option<TradingSignal>, SignalError> {
    let (stop, target) = match direction {
        Direction::Buy => (entry - stop_distance, entry + stop_distance * reward_multiple),
        Direction::Sell => (entry + stop_distance, entry - stop_distance * reward_multiple),
    };
    if stop <= 0.0 || target <= 0.0 {
        return Ok(None);
    }
    TradingSignal::new(symbol, direction, conf, entry, stop, target).map(Some)
}

// -----------------------------------------------------------------------------
// 1) MEAN-REVERSION
//    Close below SMA(window) by more than `edge_ranges` average ranges -> Buy,
//    above by the same -> Sell.
// -----------------------------------------------------------------------------
pub struct MeanReversion {
    pub window: usize,
    pub edge_ranges: f64,
    pub stop_ranges: f64,
    pub reward_multiple: f64,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self { window: 64, edge_ranges: 1.5, stop_ranges: 2.0, reward_multiple: 2.5 }
    }
}

#[async_trait]
impl SignalGenerator for MeanReversion {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    async fn generate_signal(
        &self,
        symbol: &str,
        candles: &[Candle],
        _sentiment: Option<&Sentiment>,
    ) -> Result<Option<TradingSignal>, SignalError> {
        if candles.len() < self.window {
            return Ok(None);
        }
        let recent = &candles[candles.len() - self.window..];
        let (Some(fair), Some(range)) = (sma(recent.iter().map(|c| c.close), self.window), avg_range(recent)) else {
            return Ok(None);
        };
        let Some(last) = recent.last() else { return Ok(None) };
        let edge = range * self.edge_ranges;
        let dev = last.close - fair;

        let direction = if dev < -edge {
            Direction::Buy
        } else if dev > edge {
            Direction::Sell
        } else {
            return Ok(None);
        };
        let conf = confidence((dev.abs() - edge) / edge, 0.6);
        let out = build(symbol, direction, conf, last.close, range * self.stop_ranges, self.reward_multiple)?;
        if out.is_some() {
            SIGNALS_BY.with_label_values(&[self.name(), symbol]).inc();
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// 2) VOLATILITY BREAKOUT
//    Close beyond the rolling high/low of the previous `window` candles plus
//    a buffer -> trade in the breakout direction.
// -----------------------------------------------------------------------------
pub struct VolBreakout {
    pub window: usize,
    pub buffer_ranges: f64,
    pub stop_ranges: f64,
    pub reward_multiple: f64,
}

impl Default for VolBreakout {
    fn default() -> Self {
        Self { window: 100, buffer_ranges: 0.25, stop_ranges: 1.5, reward_multiple: 2.0 }
    }
}

#[async_trait]
impl SignalGenerator for VolBreakout {
    fn name(&self) -> &'static str {
        "vol_breakout"
    }

    async fn generate_signal(
        &self,
        symbol: &str,
        candles: &[Candle],
        _sentiment: Option<&Sentiment>,
    ) -> Result<Option<TradingSignal>, SignalError> {
        if candles.len() < self.window + 1 {
            return Ok(None);
        }
        let (hist, tail) = candles.split_at(candles.len() - 1);
        let hist = &hist[hist.len() - self.window..];
        let Some(last) = tail.first() else { return Ok(None) };
        let Some(range) = avg_range(hist) else { return Ok(None) };

        let hi = hist.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lo = hist.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let buffer = range * self.buffer_ranges;

        let (direction, excess) = if last.close > hi + buffer {
            (Direction::Buy, last.close - hi - buffer)
        } else if last.close < lo - buffer {
            (Direction::Sell, lo - buffer - last.close)
        } else {
            return Ok(None);
        };
        let conf = confidence(excess / range, 0.55);
        let out = build(symbol, direction, conf, last.close, range * self.stop_ranges, self.reward_multiple)?;
        if out.is_some() {
            SIGNALS_BY.with_label_values(&[self.name(), symbol]).inc();
        }
        Ok(out)
    }
}
