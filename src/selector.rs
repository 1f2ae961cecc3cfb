//! Strategy selection for the current regime.
//!
//! Ranking reads ledger summaries only. Buckets that have not yet seen
//! `min_trades` closed trades are in warm-up and are always preferred, so
//! every eligible strategy collects evidence before the ranking takes over.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::ledger::{PerformanceLedger, PerformanceSummary};
use crate::regime::RegimeKind;
use crate::strategy::StrategyDefinition;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Trades a bucket needs before it is ranked on performance
    pub min_trades: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self { min_trades: 10 }
    }
}

impl SelectorConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.min_trades == 0 {
            return Err(EngineError::config("selector.min_trades", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionBasis {
    WarmUp,
    Ranked,
}

impl SelectionBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionBasis::WarmUp => "warm_up",
            SelectionBasis::Ranked => "ranked",
        }
    }
}

#[derive(Clone)]
pub struct Selection {
    pub strategy: Arc<dyn StrategyDefinition>,
    pub basis: SelectionBasis,
    pub summary: PerformanceSummary,
    pub candidates: usize,
}

impl Selection {
    pub fn strategy_id(&self) -> &str {
        self.strategy.id()
    }
}

pub struct StrategySelector {
    cfg: SelectorConfig,
}

impl StrategySelector {
    pub fn new(cfg: SelectorConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.cfg
    }

    /// Pick one of `eligible` for `regime`. `None` only when nothing is eligible.
    pub fn select(
        &self,
        regime: RegimeKind,
        eligible: &[Arc<dyn StrategyDefinition>],
        ledger: &PerformanceLedger,
    ) -> Option<Selection> {
        let scored: Vec<(Arc<dyn StrategyDefinition>, PerformanceSummary)> = eligible
            .iter()
            .map(|def| (def.clone(), ledger.summary_for(def.id(), regime)))
            .collect();

        let warming = scored
            .iter()
            .filter(|(_, s)| s.trade_count < self.cfg.min_trades)
            .min_by(|(a, sa), (b, sb)| {
                sa.trade_count
                    .cmp(&sb.trade_count)
                    .then_with(|| a.id().cmp(b.id()))
            });

        let (picked, basis) = match warming {
            Some(entry) => (entry, SelectionBasis::WarmUp),
            None => (
                scored.iter().min_by(|(a, sa), (b, sb)| rank(a.id(), sa, b.id(), sb))?,
                SelectionBasis::Ranked,
            ),
        };

        Some(Selection {
            strategy: picked.0.clone(),
            basis,
            summary: picked.1.clone(),
            candidates: eligible.len(),
        })
    }
}

/// Profit factor desc, then win rate desc, then id asc.
fn rank(a_id: &str, a: &PerformanceSummary, b_id: &str, b: &PerformanceSummary) -> Ordering {
    b.profit_factor
        .total_cmp(&a.profit_factor)
        .then_with(|| b.win_rate.total_cmp(&a.win_rate))
        .then_with(|| a_id.cmp(b_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Outcome, PerformanceRecord};
    use crate::market::Side;
    use crate::strategies::{default_registry, StrategyConfig};

    fn record(strategy: &str, regime: RegimeKind, pnl: f64, ts: u64) -> PerformanceRecord {
        PerformanceRecord {
            strategy_id: strategy.into(),
            symbol: "BTCUSDT".into(),
            regime,
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size: 1.0,
            pnl,
            duration_ms: 1_000,
            outcome: Outcome::from_pnl(pnl),
            opened_at: ts,
            closed_at: ts + 1_000,
            exit_reason: "strategy".into(),
        }
    }

    fn fill(ledger: &mut PerformanceLedger, strategy: &str, regime: RegimeKind, wins: u64, losses: u64, win: f64, loss: f64) {
        let mut ts = 0;
        for _ in 0..wins {
            ledger.append(record(strategy, regime, win, ts)).unwrap();
            ts += 10_000;
        }
        for _ in 0..losses {
            ledger.append(record(strategy, regime, -loss, ts)).unwrap();
            ts += 10_000;
        }
    }

    #[test]
    fn warm_up_bucket_beats_poor_veteran_until_warm() {
        let registry = default_registry(&StrategyConfig::default()).unwrap();
        let regime = RegimeKind::ChoppyCalm;
        let eligible = registry.list_eligible(regime);
        let selector = StrategySelector::new(SelectorConfig { min_trades: 10 });

        // range_fade_short: 50 trades at 30% win rate. range_revert_long: fresh.
        let mut ledger = PerformanceLedger::new();
        fill(&mut ledger, "range_fade_short", regime, 15, 35, 1.0, 1.0);

        let pick = selector.select(regime, &eligible, &ledger).unwrap();
        assert_eq!(pick.strategy_id(), "range_revert_long");
        assert_eq!(pick.basis, SelectionBasis::WarmUp);

        // Warm-up persists through nine trades.
        fill(&mut ledger, "range_revert_long", regime, 9, 0, 1.0, 1.0);
        let pick = selector.select(regime, &eligible, &ledger).unwrap();
        assert_eq!(pick.strategy_id(), "range_revert_long");
        assert_eq!(pick.basis, SelectionBasis::WarmUp);

        // Tenth trade ends warm-up; now ranking decides, and both are warm.
        fill(&mut ledger, "range_revert_long", regime, 0, 1, 1.0, 0.5);
        let pick = selector.select(regime, &eligible, &ledger).unwrap();
        assert_eq!(pick.basis, SelectionBasis::Ranked);
        assert_eq!(pick.strategy_id(), "range_revert_long");
        assert_eq!(pick.candidates, 2);
    }

    #[test]
    fn ranked_by_profit_factor_then_win_rate_then_id() {
        let registry = default_registry(&StrategyConfig::default()).unwrap();
        let regime = RegimeKind::Breakout;
        let eligible = registry.list_eligible(regime);
        let selector = StrategySelector::new(SelectorConfig { min_trades: 2 });

        let mut ledger = PerformanceLedger::new();
        fill(&mut ledger, "trend_long", regime, 1, 1, 2.0, 1.0);
        fill(&mut ledger, "trend_short", regime, 2, 2, 2.0, 1.0);
        // Equal profit factor and win rate: lowest id wins.
        let pick = selector.select(regime, &eligible, &ledger).unwrap();
        assert_eq!(pick.strategy_id(), "trend_long");

        fill(&mut ledger, "trend_short", regime, 1, 0, 2.0, 1.0);
        let pick = selector.select(regime, &eligible, &ledger).unwrap();
        assert_eq!(pick.strategy_id(), "trend_short");
    }

    #[test]
    fn fewest_trades_warm_up_first() {
        let registry = default_registry(&StrategyConfig::default()).unwrap();
        let regime = RegimeKind::ChoppyVolatile;
        let eligible = registry.list_eligible(regime);
        let selector = StrategySelector::new(SelectorConfig::default());

        let mut ledger = PerformanceLedger::new();
        fill(&mut ledger, "range_fade_short", regime, 1, 0, 1.0, 1.0);
        fill(&mut ledger, "range_revert_long", regime, 2, 0, 1.0, 1.0);
        let pick = selector.select(regime, &eligible, &ledger).unwrap();
        assert_eq!(pick.strategy_id(), "range_fade_short");
    }

    #[test]
    fn nothing_eligible_selects_nothing() {
        let selector = StrategySelector::new(SelectorConfig::default());
        assert!(selector
            .select(RegimeKind::ChoppyCalm, &[], &PerformanceLedger::new())
            .is_none());
    }

    #[test]
    fn selection_is_deterministic() {
        let registry = default_registry(&StrategyConfig::default()).unwrap();
        let eligible = registry.list_eligible(RegimeKind::TrendingBullish);
        let selector = StrategySelector::new(SelectorConfig::default());
        let ledger = PerformanceLedger::new();
        let a = selector.select(RegimeKind::TrendingBullish, &eligible, &ledger).unwrap();
        let b = selector.select(RegimeKind::TrendingBullish, &eligible, &ledger).unwrap();
        assert_eq!(a.strategy_id(), b.strategy_id());
        assert_eq!(a.summary, b.summary);
    }
}
