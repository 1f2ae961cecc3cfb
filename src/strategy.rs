//! Strategy contract and registry.
//!
//! A strategy is a fixed rule set: an entry predicate, an exit predicate and
//! static risk parameters, eligible for one or more regimes. Definitions are
//! registered at configuration time and the registry is frozen behind an
//! `Arc` before any cycle runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::market::{MarketSnapshot, Side};
use crate::position::Position;
use crate::regime::RegimeKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskParameters {
    pub stop_loss_fraction: f64,
    pub take_profit_fraction: f64,
    /// Fraction of session capital committed per entry
    pub position_size_fraction: f64,
}

impl RiskParameters {
    pub fn validate(&self, strategy_id: &str) -> EngineResult<()> {
        let checks = [
            ("stop_loss_fraction", self.stop_loss_fraction),
            ("take_profit_fraction", self.take_profit_fraction),
            ("position_size_fraction", self.position_size_fraction),
        ];
        for (name, value) in checks {
            if !(value > 0.0 && value < 1.0) {
                return Err(EngineError::config(
                    &format!("strategy.{}.{}", strategy_id, name),
                    format!("must be in (0, 1), got {}", value),
                ));
            }
        }
        Ok(())
    }
}

/// The three evaluators every strategy exposes, plus identity and affinity.
///
/// Evaluators are pure: they read the snapshot (and position) and never
/// keep state between calls.
pub trait StrategyDefinition: Send + Sync {
    fn id(&self) -> &str;

    fn label(&self) -> &str;

    fn regimes(&self) -> &[RegimeKind];

    fn side(&self) -> Side;

    /// Only evaluated when the symbol has no open position.
    fn should_enter(&self, snapshot: &MarketSnapshot) -> bool;

    /// Only evaluated while `position` is open.
    fn should_exit(&self, snapshot: &MarketSnapshot, position: &Position) -> bool;

    fn risk_parameters(&self) -> RiskParameters;

    fn eligible_for(&self, regime: RegimeKind) -> bool {
        self.regimes().contains(&regime)
    }
}

#[derive(Default)]
pub struct StrategyRegistry {
    // BTreeMap keeps iteration ordered by id.
    definitions: BTreeMap<String, Arc<dyn StrategyDefinition>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: Arc<dyn StrategyDefinition>) -> EngineResult<()> {
        let id = def.id().to_string();
        if id.is_empty() {
            return Err(EngineError::config("strategy.id", "must not be empty"));
        }
        if self.definitions.contains_key(&id) {
            return Err(EngineError::config(&format!("strategy.{}", id), "duplicate id"));
        }
        if def.regimes().is_empty() {
            return Err(EngineError::config(
                &format!("strategy.{}.regimes", id),
                "must list at least one regime",
            ));
        }
        def.risk_parameters().validate(&id)?;
        self.definitions.insert(id, def);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<dyn StrategyDefinition>> {
        self.definitions.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn StrategyDefinition>> {
        self.definitions.get(id).cloned()
    }

    /// Definitions eligible for `regime`, ordered by id.
    pub fn list_eligible(&self, regime: RegimeKind) -> Vec<Arc<dyn StrategyDefinition>> {
        self.definitions
            .values()
            .filter(|d| d.eligible_for(regime))
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        id: &'static str,
        regimes: Vec<RegimeKind>,
        params: RiskParameters,
    }

    impl StrategyDefinition for Fixed {
        fn id(&self) -> &str {
            self.id
        }
        fn label(&self) -> &str {
            "fixed"
        }
        fn regimes(&self) -> &[RegimeKind] {
            &self.regimes
        }
        fn side(&self) -> Side {
            Side::Long
        }
        fn should_enter(&self, _snapshot: &MarketSnapshot) -> bool {
            true
        }
        fn should_exit(&self, _snapshot: &MarketSnapshot, _position: &Position) -> bool {
            false
        }
        fn risk_parameters(&self) -> RiskParameters {
            self.params
        }
    }

    fn params() -> RiskParameters {
        RiskParameters {
            stop_loss_fraction: 0.02,
            take_profit_fraction: 0.04,
            position_size_fraction: 0.1,
        }
    }

    fn fixed(id: &'static str, regimes: &[RegimeKind]) -> Arc<dyn StrategyDefinition> {
        Arc::new(Fixed { id, regimes: regimes.to_vec(), params: params() })
    }

    #[test]
    fn list_eligible_filters_and_orders_by_id() {
        let mut reg = StrategyRegistry::new();
        reg.register(fixed("zeta", &[RegimeKind::ChoppyCalm])).unwrap();
        reg.register(fixed("alpha", &[RegimeKind::ChoppyCalm, RegimeKind::Breakout])).unwrap();
        reg.register(fixed("mid", &[RegimeKind::TrendingBullish])).unwrap();

        let ids: Vec<String> = reg
            .list_eligible(RegimeKind::ChoppyCalm)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert!(reg.list_eligible(RegimeKind::TrendingBearish).is_empty());
    }

    #[test]
    fn duplicate_id_is_config_error() {
        let mut reg = StrategyRegistry::new();
        reg.register(fixed("alpha", &[RegimeKind::ChoppyCalm])).unwrap();
        let err = reg.register(fixed("alpha", &[RegimeKind::Breakout])).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn invalid_risk_parameters_rejected() {
        let mut reg = StrategyRegistry::new();
        let bad = Arc::new(Fixed {
            id: "bad",
            regimes: vec![RegimeKind::ChoppyCalm],
            params: RiskParameters { stop_loss_fraction: 0.0, ..params() },
        });
        assert!(reg.register(bad).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn definition_without_regimes_rejected() {
        let mut reg = StrategyRegistry::new();
        assert!(reg.register(fixed("orphan", &[])).is_err());
    }

    #[test]
    fn remove_drops_definition() {
        let mut reg = StrategyRegistry::new();
        reg.register(fixed("alpha", &[RegimeKind::ChoppyCalm])).unwrap();
        assert!(reg.remove("alpha").is_some());
        assert!(reg.get("alpha").is_none());
    }
}
