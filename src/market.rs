//! Normalized market input consumed by the engine.
//!
//! Snapshots are produced by a feed collaborator once per cycle and never
//! mutated afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: u64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

/// Derived indicator set attached to every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    /// Directional efficiency scaled to 0..100 (higher = cleaner trend)
    pub trend_strength: f64,
    /// Average true range as a fraction of price
    pub volatility_range: f64,
    /// Rank of the current volatility within its history, 0..1
    pub volatility_percentile: f64,
    pub ma_fast: f64,
    pub ma_slow: f64,
    /// RSI-style oscillator, 0..100
    pub momentum: f64,
    /// Bollinger band width as a fraction of the middle band
    pub band_width: f64,
    pub band_width_mean: f64,
    pub band_width_std: f64,
}

impl Indicators {
    /// Name of the first non-finite field, if any.
    pub fn first_invalid(&self) -> Option<&'static str> {
        let fields = [
            ("trend_strength", self.trend_strength),
            ("volatility_range", self.volatility_range),
            ("volatility_percentile", self.volatility_percentile),
            ("ma_fast", self.ma_fast),
            ("ma_slow", self.ma_slow),
            ("momentum", self.momentum),
            ("band_width", self.band_width),
            ("band_width_mean", self.band_width_mean),
            ("band_width_std", self.band_width_std),
        ];
        fields
            .iter()
            .find(|(_, v)| !v.is_finite())
            .map(|(name, _)| *name)
    }

    /// Standard deviations the current band width sits above its mean.
    pub fn band_width_zscore(&self) -> f64 {
        if self.band_width_std <= 0.0 {
            return 0.0;
        }
        (self.band_width - self.band_width_mean) / self.band_width_std
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    /// Epoch milliseconds
    pub ts: u64,
    pub candles: Vec<Candle>,
    pub indicators: Indicators,
}

impl MarketSnapshot {
    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Close of the latest candle, the reference price for decisions.
    pub fn price(&self) -> Option<f64> {
        self.last().map(|c| c.c).filter(|p| p.is_finite() && *p > 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_invalid_names_nan_field() {
        let mut ind = Indicators::default();
        assert_eq!(ind.first_invalid(), None);
        ind.momentum = f64::NAN;
        assert_eq!(ind.first_invalid(), Some("momentum"));
        ind.trend_strength = f64::INFINITY;
        assert_eq!(ind.first_invalid(), Some("trend_strength"));
    }

    #[test]
    fn zscore_is_zero_without_dispersion() {
        let ind = Indicators {
            band_width: 0.2,
            band_width_mean: 0.1,
            band_width_std: 0.0,
            ..Default::default()
        };
        assert_eq!(ind.band_width_zscore(), 0.0);
    }

    #[test]
    fn price_rejects_empty_window() {
        let snap = MarketSnapshot {
            symbol: "BTCUSDT".into(),
            ts: 0,
            candles: vec![],
            indicators: Indicators::default(),
        };
        assert_eq!(snap.price(), None);
    }
}
