//! Regime classification from a single market snapshot.
//!
//! Signals are checked in a fixed priority order so that a snapshot matching
//! several regimes always maps to the same one:
//!
//! ```text
//! Breakout  >  Trending{Bullish,Bearish}  >  Choppy{Volatile,Calm}
//! ```
//!
//! The classifier is a pure function of the indicator block. It holds no
//! history, so the same snapshot always classifies the same way.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, EngineResult};
use crate::market::{Indicators, MarketSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeKind {
    TrendingBullish,
    TrendingBearish,
    ChoppyVolatile,
    ChoppyCalm,
    Breakout,
}

impl RegimeKind {
    pub const ALL: [RegimeKind; 5] = [
        RegimeKind::TrendingBullish,
        RegimeKind::TrendingBearish,
        RegimeKind::ChoppyVolatile,
        RegimeKind::ChoppyCalm,
        RegimeKind::Breakout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeKind::TrendingBullish => "trending_bullish",
            RegimeKind::TrendingBearish => "trending_bearish",
            RegimeKind::ChoppyVolatile => "choppy_volatile",
            RegimeKind::ChoppyCalm => "choppy_calm",
            RegimeKind::Breakout => "breakout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    pub fn is_trending(&self) -> bool {
        matches!(self, RegimeKind::TrendingBullish | RegimeKind::TrendingBearish)
    }
}

impl fmt::Display for RegimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification result with the inputs that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Regime {
    pub kind: RegimeKind,
    /// 0.0..=1.0
    pub confidence: f64,
    pub indicators: Indicators,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Trend strength (0..100) above which a market can be trending
    pub trend_threshold: f64,
    /// Volatility percentile (0..1) above which a non-trending market is volatile
    pub volatility_percentile_threshold: f64,
    /// Band width z-score that marks a breakout
    pub breakout_sigma: f64,
    /// Lowest confidence a matched regime reports
    pub min_confidence: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            trend_threshold: 25.0,
            volatility_percentile_threshold: 0.7,
            breakout_sigma: 2.5,
            min_confidence: 0.5,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.trend_threshold > 0.0 && self.trend_threshold < 100.0) {
            return Err(EngineError::config("classifier.trend_threshold", "must be in (0, 100)"));
        }
        if !(self.volatility_percentile_threshold > 0.0 && self.volatility_percentile_threshold < 1.0) {
            return Err(EngineError::config(
                "classifier.volatility_percentile_threshold",
                "must be in (0, 1)",
            ));
        }
        if !(self.breakout_sigma > 0.0) {
            return Err(EngineError::config("classifier.breakout_sigma", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(EngineError::config("classifier.min_confidence", "must be in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegimeClassifier {
    cfg: ClassifierConfig,
}

impl RegimeClassifier {
    pub fn new(cfg: ClassifierConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.cfg
    }

    pub fn classify(&self, snapshot: &MarketSnapshot) -> EngineResult<Regime> {
        if snapshot.price().is_none() {
            return Err(EngineError::insufficient(&snapshot.symbol, "empty or invalid candle window"));
        }
        let ind = snapshot.indicators;
        if let Some(field) = ind.first_invalid() {
            return Err(EngineError::insufficient(
                &snapshot.symbol,
                format!("indicator {} is not finite", field),
            ));
        }

        let (kind, confidence) = self.decide(&ind);
        Ok(Regime {
            kind,
            confidence: confidence.max(self.cfg.min_confidence).min(1.0),
            indicators: ind,
        })
    }

    fn decide(&self, ind: &Indicators) -> (RegimeKind, f64) {
        let cfg = &self.cfg;

        let z = ind.band_width_zscore();
        if z > cfg.breakout_sigma {
            return (RegimeKind::Breakout, excess_confidence(z, cfg.breakout_sigma));
        }

        if ind.trend_strength > cfg.trend_threshold {
            let conf = excess_confidence(ind.trend_strength, cfg.trend_threshold);
            if ind.ma_fast > ind.ma_slow {
                return (RegimeKind::TrendingBullish, conf);
            }
            if ind.ma_fast < ind.ma_slow {
                return (RegimeKind::TrendingBearish, conf);
            }
        }

        let vol_th = cfg.volatility_percentile_threshold;
        if ind.volatility_percentile > vol_th {
            return (
                RegimeKind::ChoppyVolatile,
                excess_confidence(ind.volatility_percentile, vol_th),
            );
        }

        // Calm: how far below both thresholds we sit, averaged.
        let trend_gap = (1.0 - ind.trend_strength / cfg.trend_threshold).clamp(0.0, 1.0);
        let vol_gap = (1.0 - ind.volatility_percentile / vol_th).clamp(0.0, 1.0);
        (RegimeKind::ChoppyCalm, 0.5 + 0.25 * (trend_gap + vol_gap))
    }
}

/// 0.5 at the threshold, rising linearly to 1.0 at twice the threshold.
fn excess_confidence(value: f64, threshold: f64) -> f64 {
    0.5 + 0.5 * ((value - threshold) / threshold).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Candle;

    fn snapshot(ind: Indicators) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".into(),
            ts: 1_000,
            candles: vec![Candle { ts: 1_000, o: 100.0, h: 101.0, l: 99.0, c: 100.5, v: 1.0 }],
            indicators: ind,
        }
    }

    fn calm() -> Indicators {
        Indicators {
            trend_strength: 10.0,
            volatility_range: 0.004,
            volatility_percentile: 0.3,
            ma_fast: 100.0,
            ma_slow: 100.0,
            momentum: 50.0,
            band_width: 0.02,
            band_width_mean: 0.02,
            band_width_std: 0.005,
        }
    }

    #[test]
    fn test_trending_bullish_with_confidence_floor() {
        let classifier = RegimeClassifier::default();
        let ind = Indicators { trend_strength: 40.0, ma_fast: 105.0, ma_slow: 100.0, ..calm() };
        let regime = classifier.classify(&snapshot(ind)).unwrap();
        assert_eq!(regime.kind, RegimeKind::TrendingBullish);
        assert!(regime.confidence >= classifier.config().min_confidence);
        assert!((regime.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_trending_bearish() {
        let classifier = RegimeClassifier::default();
        let ind = Indicators { trend_strength: 60.0, ma_fast: 95.0, ma_slow: 100.0, ..calm() };
        let regime = classifier.classify(&snapshot(ind)).unwrap();
        assert_eq!(regime.kind, RegimeKind::TrendingBearish);
        assert_eq!(regime.confidence, 1.0);
    }

    #[test]
    fn test_strong_trend_without_alignment_is_choppy() {
        let classifier = RegimeClassifier::default();
        let ind = Indicators { trend_strength: 60.0, volatility_percentile: 0.9, ..calm() };
        let regime = classifier.classify(&snapshot(ind)).unwrap();
        assert_eq!(regime.kind, RegimeKind::ChoppyVolatile);
    }

    #[test]
    fn test_breakout_outranks_trend() {
        let classifier = RegimeClassifier::default();
        let ind = Indicators {
            trend_strength: 80.0,
            ma_fast: 110.0,
            ma_slow: 100.0,
            band_width: 0.05,
            band_width_mean: 0.02,
            band_width_std: 0.005,
            ..calm()
        };
        let regime = classifier.classify(&snapshot(ind)).unwrap();
        assert_eq!(regime.kind, RegimeKind::Breakout);
    }

    #[test]
    fn test_calm_market() {
        let classifier = RegimeClassifier::default();
        let regime = classifier.classify(&snapshot(calm())).unwrap();
        assert_eq!(regime.kind, RegimeKind::ChoppyCalm);
        assert!(regime.confidence >= 0.5 && regime.confidence <= 1.0);
    }

    #[test]
    fn test_nan_indicator_is_insufficient_data() {
        let classifier = RegimeClassifier::default();
        let ind = Indicators { ma_slow: f64::NAN, ..calm() };
        let err = classifier.classify(&snapshot(ind)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[test]
    fn test_empty_window_is_insufficient_data() {
        let classifier = RegimeClassifier::default();
        let mut snap = snapshot(calm());
        snap.candles.clear();
        assert!(classifier.classify(&snap).is_err());
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = RegimeClassifier::default();
        let snap = snapshot(Indicators { trend_strength: 30.0, ma_fast: 101.0, ..calm() });
        let first = classifier.classify(&snap).unwrap();
        for _ in 0..10 {
            assert_eq!(classifier.classify(&snap).unwrap(), first);
        }
    }

    #[test]
    fn test_regime_kind_parse_roundtrip() {
        for kind in RegimeKind::ALL {
            assert_eq!(RegimeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RegimeKind::parse("reflexive"), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(ClassifierConfig::default().validate().is_ok());
        let bad = ClassifierConfig { breakout_sigma: 0.0, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}
