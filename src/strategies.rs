//! The closed set of strategies shipped with the engine.
//!
//! Each strategy combines:
//! - Entry rule (when to open)
//! - Exit rule (when to close, on top of stop/target)
//! - Risk parameters (stop, target, size)
//! - Regime affinity (when it may be selected)

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::market::{MarketSnapshot, Side};
use crate::position::Position;
use crate::regime::RegimeKind;
use crate::strategy::{RiskParameters, StrategyDefinition, StrategyRegistry};

// =============================================================================
// Strategy Configuration
// =============================================================================

/// Thresholds shared by the built-in strategies.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Momentum needed to join a trend (mirrored for shorts)
    pub trend_entry_momentum: f64,
    /// Momentum below which a trend position is abandoned (mirrored for shorts)
    pub trend_exit_momentum: f64,
    pub oversold: f64,
    pub overbought: f64,
    /// Momentum level at which a range trade has reverted
    pub revert_exit: f64,
    pub trend_risk: RiskParameters,
    pub range_risk: RiskParameters,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            trend_entry_momentum: 55.0,
            trend_exit_momentum: 45.0,
            oversold: 30.0,
            overbought: 70.0,
            revert_exit: 50.0,
            trend_risk: RiskParameters {
                stop_loss_fraction: 0.02,
                take_profit_fraction: 0.05,
                position_size_fraction: 0.10,
            },
            range_risk: RiskParameters {
                stop_loss_fraction: 0.01,
                take_profit_fraction: 0.015,
                position_size_fraction: 0.05,
            },
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let levels = [
            ("trend_entry_momentum", self.trend_entry_momentum),
            ("trend_exit_momentum", self.trend_exit_momentum),
            ("oversold", self.oversold),
            ("overbought", self.overbought),
            ("revert_exit", self.revert_exit),
        ];
        for (name, level) in levels {
            if !(0.0..=100.0).contains(&level) {
                return Err(EngineError::config(&format!("strategies.{}", name), "must be in [0, 100]"));
            }
        }
        if self.trend_exit_momentum >= self.trend_entry_momentum {
            return Err(EngineError::config(
                "strategies.trend_exit_momentum",
                "must sit below trend_entry_momentum",
            ));
        }
        if !(self.oversold < self.revert_exit && self.revert_exit < self.overbought) {
            return Err(EngineError::config(
                "strategies.revert_exit",
                "need oversold < revert_exit < overbought",
            ));
        }
        self.trend_risk.validate("trend")?;
        self.range_risk.validate("range")
    }
}

/// Mirror an oscillator threshold around 50 for the short side.
fn mirrored(level: f64) -> f64 {
    100.0 - level
}

// =============================================================================
// Trend following
// =============================================================================

/// Join an established or breaking-out uptrend while price holds above the
/// fast average.
pub struct TrendLong {
    cfg: StrategyConfig,
}

impl StrategyDefinition for TrendLong {
    fn id(&self) -> &str {
        "trend_long"
    }

    fn label(&self) -> &str {
        "Trend follow (long)"
    }

    fn regimes(&self) -> &[RegimeKind] {
        &[RegimeKind::TrendingBullish, RegimeKind::Breakout]
    }

    fn side(&self) -> Side {
        Side::Long
    }

    fn should_enter(&self, snapshot: &MarketSnapshot) -> bool {
        let ind = &snapshot.indicators;
        match snapshot.price() {
            Some(price) => ind.momentum >= self.cfg.trend_entry_momentum && price > ind.ma_fast,
            None => false,
        }
    }

    fn should_exit(&self, snapshot: &MarketSnapshot, _position: &Position) -> bool {
        let ind = &snapshot.indicators;
        match snapshot.price() {
            Some(price) => price < ind.ma_slow || ind.momentum < self.cfg.trend_exit_momentum,
            None => false,
        }
    }

    fn risk_parameters(&self) -> RiskParameters {
        self.cfg.trend_risk
    }
}

pub struct TrendShort {
    cfg: StrategyConfig,
}

impl StrategyDefinition for TrendShort {
    fn id(&self) -> &str {
        "trend_short"
    }

    fn label(&self) -> &str {
        "Trend follow (short)"
    }

    fn regimes(&self) -> &[RegimeKind] {
        &[RegimeKind::TrendingBearish, RegimeKind::Breakout]
    }

    fn side(&self) -> Side {
        Side::Short
    }

    fn should_enter(&self, snapshot: &MarketSnapshot) -> bool {
        let ind = &snapshot.indicators;
        match snapshot.price() {
            Some(price) => {
                ind.momentum <= mirrored(self.cfg.trend_entry_momentum) && price < ind.ma_fast
            }
            None => false,
        }
    }

    fn should_exit(&self, snapshot: &MarketSnapshot, _position: &Position) -> bool {
        let ind = &snapshot.indicators;
        match snapshot.price() {
            Some(price) => {
                price > ind.ma_slow || ind.momentum > mirrored(self.cfg.trend_exit_momentum)
            }
            None => false,
        }
    }

    fn risk_parameters(&self) -> RiskParameters {
        self.cfg.trend_risk
    }
}

// =============================================================================
// Range trading
// =============================================================================

/// Buy oversold dips inside a range, out once momentum normalises.
pub struct RangeRevertLong {
    cfg: StrategyConfig,
}

impl StrategyDefinition for RangeRevertLong {
    fn id(&self) -> &str {
        "range_revert_long"
    }

    fn label(&self) -> &str {
        "Range mean reversion (long)"
    }

    fn regimes(&self) -> &[RegimeKind] {
        &[RegimeKind::ChoppyCalm, RegimeKind::ChoppyVolatile]
    }

    fn side(&self) -> Side {
        Side::Long
    }

    fn should_enter(&self, snapshot: &MarketSnapshot) -> bool {
        snapshot.indicators.momentum <= self.cfg.oversold
    }

    fn should_exit(&self, snapshot: &MarketSnapshot, _position: &Position) -> bool {
        snapshot.indicators.momentum >= self.cfg.revert_exit
    }

    fn risk_parameters(&self) -> RiskParameters {
        self.cfg.range_risk
    }
}

/// Sell overbought pops inside a range.
pub struct RangeFadeShort {
    cfg: StrategyConfig,
}

impl StrategyDefinition for RangeFadeShort {
    fn id(&self) -> &str {
        "range_fade_short"
    }

    fn label(&self) -> &str {
        "Range fade (short)"
    }

    fn regimes(&self) -> &[RegimeKind] {
        &[RegimeKind::ChoppyCalm, RegimeKind::ChoppyVolatile]
    }

    fn side(&self) -> Side {
        Side::Short
    }

    fn should_enter(&self, snapshot: &MarketSnapshot) -> bool {
        snapshot.indicators.momentum >= self.cfg.overbought
    }

    fn should_exit(&self, snapshot: &MarketSnapshot, _position: &Position) -> bool {
        snapshot.indicators.momentum <= self.cfg.revert_exit
    }

    fn risk_parameters(&self) -> RiskParameters {
        self.cfg.range_risk
    }
}

/// Registry holding every built-in strategy.
pub fn default_registry(cfg: &StrategyConfig) -> EngineResult<StrategyRegistry> {
    let mut registry = StrategyRegistry::new();
    registry.register(Arc::new(TrendLong { cfg: cfg.clone() }))?;
    registry.register(Arc::new(TrendShort { cfg: cfg.clone() }))?;
    registry.register(Arc::new(RangeRevertLong { cfg: cfg.clone() }))?;
    registry.register(Arc::new(RangeFadeShort { cfg: cfg.clone() }))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Candle, Indicators};

    fn snap(close: f64, momentum: f64, ma_fast: f64, ma_slow: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".into(),
            ts: 0,
            candles: vec![Candle { ts: 0, o: close, h: close, l: close, c: close, v: 1.0 }],
            indicators: Indicators { momentum, ma_fast, ma_slow, ..Default::default() },
        }
    }

    #[test]
    fn default_registry_covers_every_regime() {
        let reg = default_registry(&StrategyConfig::default()).unwrap();
        assert_eq!(reg.len(), 4);
        for kind in RegimeKind::ALL {
            assert!(!reg.list_eligible(kind).is_empty(), "no strategy for {}", kind);
        }
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let cfg = StrategyConfig { oversold: 60.0, ..Default::default() };
        assert!(cfg.validate().is_err());
        assert!(StrategyConfig::default().validate().is_ok());
    }

    #[test]
    fn trend_long_enters_above_fast_average() {
        let s = TrendLong { cfg: StrategyConfig::default() };
        assert!(s.should_enter(&snap(105.0, 60.0, 104.0, 100.0)));
        assert!(!s.should_enter(&snap(103.0, 60.0, 104.0, 100.0)));
        assert!(!s.should_enter(&snap(105.0, 50.0, 104.0, 100.0)));
    }

    #[test]
    fn trend_short_mirrors_long() {
        let s = TrendShort { cfg: StrategyConfig::default() };
        assert!(s.should_enter(&snap(95.0, 40.0, 96.0, 100.0)));
        assert!(!s.should_enter(&snap(95.0, 50.0, 96.0, 100.0)));
    }

    #[test]
    fn range_strategies_use_oscillator_extremes() {
        let cfg = StrategyConfig::default();
        let long = RangeRevertLong { cfg: cfg.clone() };
        let short = RangeFadeShort { cfg };
        assert!(long.should_enter(&snap(100.0, 25.0, 100.0, 100.0)));
        assert!(!long.should_enter(&snap(100.0, 45.0, 100.0, 100.0)));
        assert!(short.should_enter(&snap(100.0, 75.0, 100.0, 100.0)));
        assert!(!short.should_enter(&snap(100.0, 60.0, 100.0, 100.0)));
    }
}
