//! Market data and health collaborators.
//!
//! The engine only sees the two traits. `SyntheticFeed` drives the demo
//! runner, `ReplayFeed` plays back fixed snapshots for tests and offline
//! runs, `ManualHealth` is a health value set from outside (operator
//! console, tests).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::indicators::{derive, IndicatorConfig};
use crate::market::{Candle, MarketSnapshot};

#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot>;
}

#[async_trait]
pub trait HealthSource: Send + Sync {
    /// `None` when no reading is available this cycle.
    async fn poll(&self) -> Option<f64>;
}

// =============================================================================
// Synthetic random walk
// =============================================================================

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub start_price: f64,
    /// Per-candle drift as a fraction of price
    pub drift: f64,
    /// Per-candle volatility as a fraction of price
    pub volatility: f64,
    pub window: usize,
    pub candle_ms: u64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            start_price: 100.0,
            drift: 0.0,
            volatility: 0.004,
            window: 120,
            candle_ms: 60_000,
            seed: 7,
        }
    }
}

struct Walk {
    rng: StdRng,
    candles: VecDeque<Candle>,
}

/// Geometric random walk per symbol. Every `snapshot` call advances the
/// symbol by one candle.
pub struct SyntheticFeed {
    cfg: SyntheticConfig,
    indicators: IndicatorConfig,
    clock: Arc<dyn Clock>,
    walks: Mutex<HashMap<String, Walk>>,
}

impl SyntheticFeed {
    pub fn new(cfg: SyntheticConfig, indicators: IndicatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            indicators,
            clock,
            walks: Mutex::new(HashMap::new()),
        }
    }

    fn seed_for(&self, symbol: &str) -> u64 {
        symbol
            .bytes()
            .fold(self.cfg.seed, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
    }

    fn step(&self, walk: &mut Walk, ts: u64) {
        let prev = walk.candles.back().map(|c| c.c).unwrap_or(self.cfg.start_price);
        // Box-Muller
        let u1: f64 = walk.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = walk.rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        let close = (prev * (1.0 + self.cfg.drift + self.cfg.volatility * z)).max(prev * 0.5);
        let wick = prev * self.cfg.volatility * walk.rng.gen_range(0.0..1.0);
        walk.candles.push_back(Candle {
            ts,
            o: prev,
            h: prev.max(close) + wick,
            l: (prev.min(close) - wick).max(f64::EPSILON),
            c: close,
            v: walk.rng.gen_range(50.0..150.0),
        });
        while walk.candles.len() > self.cfg.window {
            walk.candles.pop_front();
        }
    }
}

#[async_trait]
impl MarketFeed for SyntheticFeed {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        let now = self.clock.now_ms();
        let mut walks = self.walks.lock().map_err(|_| anyhow!("synthetic feed poisoned"))?;
        if !walks.contains_key(symbol) {
            let mut walk = Walk {
                rng: StdRng::seed_from_u64(self.seed_for(symbol)),
                candles: VecDeque::with_capacity(self.cfg.window + 1),
            };
            // Backfill a full window so the first snapshot is usable.
            let backfill = self.cfg.window.saturating_sub(1) as u64;
            for i in 0..backfill {
                let ts = now.saturating_sub((backfill - i) * self.cfg.candle_ms);
                self.step(&mut walk, ts);
            }
            walks.insert(symbol.to_string(), walk);
        }
        let walk = walks
            .get_mut(symbol)
            .ok_or_else(|| anyhow!("no walk for {}", symbol))?;
        self.step(walk, now);

        let candles: Vec<Candle> = walk.candles.iter().copied().collect();
        let indicators = derive(&candles, &self.indicators)
            .ok_or_else(|| anyhow!("{}: window of {} too short for indicators", symbol, candles.len()))?;
        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            ts: now,
            candles,
            indicators,
        })
    }
}

// =============================================================================
// Replay
// =============================================================================

/// Hands out queued snapshots per symbol, oldest first. An exhausted queue
/// is an error, which the engine treats as missing data.
#[derive(Default)]
pub struct ReplayFeed {
    queues: Mutex<HashMap<String, VecDeque<MarketSnapshot>>>,
}

impl ReplayFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, snapshot: MarketSnapshot) -> Result<()> {
        let mut queues = self.queues.lock().map_err(|_| anyhow!("replay feed poisoned"))?;
        queues
            .entry(snapshot.symbol.clone())
            .or_default()
            .push_back(snapshot);
        Ok(())
    }

    pub fn remaining(&self, symbol: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(symbol).map(VecDeque::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl MarketFeed for ReplayFeed {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        let mut queues = self.queues.lock().map_err(|_| anyhow!("replay feed poisoned"))?;
        queues
            .get_mut(symbol)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("replay exhausted for {}", symbol))
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ManualHealth {
    value: Arc<Mutex<Option<f64>>>,
}

impl ManualHealth {
    pub fn new(initial: Option<f64>) -> Self {
        Self { value: Arc::new(Mutex::new(initial)) }
    }

    pub fn set(&self, value: Option<f64>) {
        if let Ok(mut v) = self.value.lock() {
            *v = value;
        }
    }
}

#[async_trait]
impl HealthSource for ManualHealth {
    async fn poll(&self) -> Option<f64> {
        self.value.lock().ok().and_then(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn synthetic_feed_produces_complete_snapshots() {
        let clock = Arc::new(ManualClock::new(10_000_000));
        let feed = SyntheticFeed::new(SyntheticConfig::default(), IndicatorConfig::default(), clock.clone());
        let first = feed.snapshot("BTCUSDT").await.unwrap();
        assert_eq!(first.candles.len(), SyntheticConfig::default().window);
        assert!(first.indicators.first_invalid().is_none());
        assert!(first.price().is_some());

        clock.advance(60_000);
        let second = feed.snapshot("BTCUSDT").await.unwrap();
        assert_eq!(second.ts, 10_060_000);
        assert_eq!(second.candles.len(), first.candles.len());
    }

    #[tokio::test]
    async fn synthetic_feed_is_seeded_per_symbol() {
        let clock = Arc::new(ManualClock::new(10_000_000));
        let a = SyntheticFeed::new(SyntheticConfig::default(), IndicatorConfig::default(), clock.clone());
        let b = SyntheticFeed::new(SyntheticConfig::default(), IndicatorConfig::default(), clock);
        let x = a.snapshot("ETHUSDT").await.unwrap();
        let y = b.snapshot("ETHUSDT").await.unwrap();
        assert_eq!(x.candles, y.candles);
        let z = a.snapshot("SOLUSDT").await.unwrap();
        assert_ne!(x.candles.last().map(|c| c.c), z.candles.last().map(|c| c.c));
    }

    #[tokio::test]
    async fn replay_feed_drains_in_order() {
        let feed = ReplayFeed::new();
        for ts in [1, 2] {
            feed.push(MarketSnapshot {
                symbol: "BTCUSDT".into(),
                ts,
                candles: vec![],
                indicators: Default::default(),
            })
            .unwrap();
        }
        assert_eq!(feed.snapshot("BTCUSDT").await.unwrap().ts, 1);
        assert_eq!(feed.snapshot("BTCUSDT").await.unwrap().ts, 2);
        assert!(feed.snapshot("BTCUSDT").await.is_err());
        assert!(feed.snapshot("ETHUSDT").await.is_err());
    }

    #[tokio::test]
    async fn manual_health_reports_latest() {
        let health = ManualHealth::new(Some(2.5));
        assert_eq!(health.poll().await, Some(2.5));
        health.set(None);
        assert_eq!(health.poll().await, None);
    }
}
