//! Technical indicators and snapshot indicator derivation.
//!
//! Each indicator maintains its own state and can be updated incrementally.
//! [`derive`] folds an OHLCV window through them to produce the
//! [`Indicators`] block a feed attaches to a snapshot.

use std::collections::VecDeque;

use crate::error::{EngineError, EngineResult};
use crate::market::{Candle, Indicators};

// =============================================================================
// Rolling Statistics
// =============================================================================

/// Exponential moving average with configurable alpha
#[derive(Debug, Clone)]
pub struct Ema {
    pub value: f64,
    pub alpha: f64,
    initialized: bool,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            value: 0.0,
            alpha: 2.0 / (period as f64 + 1.0),
            initialized: false,
        }
    }

    pub fn update(&mut self, price: f64) -> f64 {
        if !self.initialized {
            self.value = price;
            self.initialized = true;
        } else {
            self.value = self.value * (1.0 - self.alpha) + price * self.alpha;
        }
        self.value
    }

    pub fn get(&self) -> f64 {
        self.value
    }
}

/// Windowed mean and population standard deviation
#[derive(Debug, Clone)]
pub struct RollingStats {
    window: VecDeque<f64>,
    period: usize,
}

impl RollingStats {
    pub fn new(period: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(period),
            period: period.max(1),
        }
    }

    pub fn update(&mut self, value: f64) {
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
    }

    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn std(&self) -> f64 {
        let n = self.window.len() as f64;
        if n < 2.0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt()
    }

    pub fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }
}

// =============================================================================
// Classic Technical Indicators
// =============================================================================

/// Relative Strength Index with Wilder smoothing
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    avg_gain: f64,
    avg_loss: f64,
    prev_price: Option<f64>,
    count: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            avg_gain: 0.0,
            avg_loss: 0.0,
            prev_price: None,
            count: 0,
        }
    }

    pub fn update(&mut self, price: f64) -> f64 {
        if let Some(prev) = self.prev_price {
            let change = price - prev;
            let gain = change.max(0.0);
            let loss = (-change).max(0.0);

            self.count += 1;
            if self.count <= self.period {
                self.avg_gain = (self.avg_gain * (self.count - 1) as f64 + gain) / self.count as f64;
                self.avg_loss = (self.avg_loss * (self.count - 1) as f64 + loss) / self.count as f64;
            } else {
                let alpha = 1.0 / self.period as f64;
                self.avg_gain = self.avg_gain * (1.0 - alpha) + gain * alpha;
                self.avg_loss = self.avg_loss * (1.0 - alpha) + loss * alpha;
            }
        }
        self.prev_price = Some(price);
        self.get()
    }

    pub fn get(&self) -> f64 {
        if self.avg_loss == 0.0 {
            if self.avg_gain == 0.0 {
                50.0
            } else {
                100.0
            }
        } else {
            let rs = self.avg_gain / self.avg_loss;
            100.0 - (100.0 / (1.0 + rs))
        }
    }
}

/// Bollinger band width tracker
#[derive(Debug, Clone)]
pub struct BollingerBands {
    stats: RollingStats,
    multiplier: f64,
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

impl BollingerBands {
    pub fn new(period: usize, multiplier: f64) -> Self {
        Self {
            stats: RollingStats::new(period),
            multiplier,
            middle: 0.0,
            upper: 0.0,
            lower: 0.0,
        }
    }

    pub fn update(&mut self, price: f64) {
        self.stats.update(price);
        self.middle = self.stats.mean();
        let half = self.stats.std() * self.multiplier;
        self.upper = self.middle + half;
        self.lower = self.middle - half;
    }

    pub fn bandwidth(&self) -> f64 {
        if self.middle == 0.0 {
            0.0
        } else {
            (self.upper - self.lower) / self.middle
        }
    }
}

/// Average True Range (EMA-smoothed)
#[derive(Debug, Clone)]
pub struct Atr {
    ema: Ema,
    prev_close: Option<f64>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self { ema: Ema::new(period), prev_close: None }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> f64 {
        let tr = match self.prev_close {
            Some(prev_c) => (high - low).max((high - prev_c).abs()).max((low - prev_c).abs()),
            None => high - low,
        };
        self.prev_close = Some(close);
        self.ema.update(tr)
    }
}

/// Kaufman efficiency ratio: net move over path length, 0..1
pub fn efficiency_ratio(closes: &[f64]) -> f64 {
    if closes.len() < 2 {
        return 0.0;
    }
    let net = (closes[closes.len() - 1] - closes[0]).abs();
    let path: f64 = closes.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    if path == 0.0 {
        0.0
    } else {
        net / path
    }
}

// =============================================================================
// Snapshot derivation
// =============================================================================

#[derive(Debug, Clone)]
pub struct IndicatorConfig {
    pub ma_fast: usize,
    pub ma_slow: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub band_period: usize,
    pub band_mult: f64,
    pub trend_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ma_fast: 8,
            ma_slow: 21,
            rsi_period: 14,
            atr_period: 14,
            band_period: 20,
            band_mult: 2.0,
            trend_period: 20,
        }
    }
}

impl IndicatorConfig {
    /// Candles needed before every indicator has a meaningful value.
    pub fn min_candles(&self) -> usize {
        self.ma_slow
            .max(self.band_period)
            .max(self.trend_period + 1)
            .max(self.rsi_period + 1)
            + 2
    }

    pub fn validate(&self) -> EngineResult<()> {
        let periods = [
            ("ma_fast", self.ma_fast),
            ("ma_slow", self.ma_slow),
            ("rsi_period", self.rsi_period),
            ("atr_period", self.atr_period),
            ("band_period", self.band_period),
            ("trend_period", self.trend_period),
        ];
        for (name, period) in periods {
            if period < 2 {
                return Err(EngineError::config(&format!("indicators.{}", name), "must be at least 2"));
            }
        }
        if self.ma_fast >= self.ma_slow {
            return Err(EngineError::config("indicators.ma_fast", "must be shorter than ma_slow"));
        }
        if !(self.band_mult > 0.0) {
            return Err(EngineError::config("indicators.band_mult", "must be positive"));
        }
        Ok(())
    }
}

/// Fold a candle window into the indicator set. `None` when the window is
/// too short to fill every field.
pub fn derive(candles: &[Candle], cfg: &IndicatorConfig) -> Option<Indicators> {
    if candles.len() < cfg.min_candles() {
        return None;
    }

    let mut fast = Ema::new(cfg.ma_fast);
    let mut slow = Ema::new(cfg.ma_slow);
    let mut rsi = Rsi::new(cfg.rsi_period);
    let mut atr = Atr::new(cfg.atr_period);
    let mut bands = BollingerBands::new(cfg.band_period, cfg.band_mult);
    let mut width_history = RollingStats::new(candles.len());
    let mut vol_history = Vec::with_capacity(candles.len());
    let mut last_width = 0.0;

    for (i, c) in candles.iter().enumerate() {
        fast.update(c.c);
        slow.update(c.c);
        rsi.update(c.c);
        let range = atr.update(c.h, c.l, c.c);
        if c.c > 0.0 {
            vol_history.push(range / c.c);
        }
        bands.update(c.c);
        // Width history excludes the latest candle so expansion is measured
        // against what came before it.
        if i + 1 < candles.len() {
            if i + 1 >= cfg.band_period {
                width_history.update(bands.bandwidth());
            }
        } else {
            last_width = bands.bandwidth();
        }
    }

    let volatility_range = *vol_history.last()?;
    let below = vol_history.iter().filter(|v| **v <= volatility_range).count();
    let volatility_percentile = below as f64 / vol_history.len() as f64;

    let closes: Vec<f64> = candles[candles.len() - cfg.trend_period - 1..]
        .iter()
        .map(|c| c.c)
        .collect();

    Some(Indicators {
        trend_strength: efficiency_ratio(&closes) * 100.0,
        volatility_range,
        volatility_percentile,
        ma_fast: fast.get(),
        ma_slow: slow.get(),
        momentum: rsi.get(),
        band_width: last_width,
        band_width_mean: width_history.mean(),
        band_width_std: width_history.std(),
    })
}
