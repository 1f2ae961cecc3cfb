//! Append-only performance ledger.
//!
//! Closed trades are recorded once and never touched again. Each append
//! folds the record into exactly one (strategy, regime) bucket, so summaries
//! are always equal to a replay of the records in ledger order:
//!
//! ```text
//! replay(ledger.records()).summaries() == ledger.summaries()
//! ```
//!
//! When a durable store is attached the record is written there first; the
//! in-memory append only happens once the write succeeded.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::market::Side;
use crate::regime::RegimeKind;
use crate::storage::LedgerStore;

/// Profit factor reported for a bucket with profits and no losses.
pub const PROFIT_FACTOR_CAP: f64 = 100.0;

pub type SharedLedger = Arc<tokio::sync::Mutex<PerformanceLedger>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Loss,
}

impl Outcome {
    pub fn from_pnl(pnl: f64) -> Self {
        if pnl > 0.0 {
            Outcome::Win
        } else {
            Outcome::Loss
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Loss => "loss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub strategy_id: String,
    pub symbol: String,
    pub regime: RegimeKind,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl: f64,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub opened_at: u64,
    pub closed_at: u64,
    pub exit_reason: String,
}

impl PerformanceRecord {
    /// Fractional return on entry notional.
    pub fn trade_return(&self) -> f64 {
        let notional = self.entry_price * self.size;
        if notional > 0.0 {
            self.pnl / notional
        } else {
            0.0
        }
    }

    fn validate(&self) -> EngineResult<()> {
        let finite = [self.entry_price, self.exit_price, self.size, self.pnl]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.size <= 0.0 || self.entry_price <= 0.0 {
            return Err(EngineError::Storage {
                reason: format!(
                    "refusing malformed record for {} ({}): entry={} exit={} size={} pnl={}",
                    self.symbol, self.strategy_id, self.entry_price, self.exit_price, self.size, self.pnl
                ),
            });
        }
        if self.outcome != Outcome::from_pnl(self.pnl) {
            return Err(EngineError::Storage {
                reason: format!("outcome {} disagrees with pnl {}", self.outcome.as_str(), self.pnl),
            });
        }
        Ok(())
    }
}

/// Derived per-bucket aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub strategy_id: String,
    pub regime: RegimeKind,
    pub trade_count: u64,
    pub wins: u64,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    /// Mean trade return over its standard deviation
    pub vol_normalized_return: f64,
    /// Largest peak-to-trough fall of the bucket's cumulative P&L
    pub max_drawdown: f64,
    pub last_updated: u64,
}

/// Running state behind a summary. O(1) per record.
#[derive(Debug, Clone, Default, PartialEq)]
struct BucketStats {
    trades: u64,
    wins: u64,
    gross_profit: f64,
    gross_loss: f64,
    ret_mean: f64,
    ret_m2: f64,
    cum_pnl: f64,
    peak_pnl: f64,
    max_drawdown: f64,
    last_updated: u64,
}

impl BucketStats {
    fn apply(&mut self, record: &PerformanceRecord) {
        self.trades += 1;
        if record.outcome == Outcome::Win {
            self.wins += 1;
            self.gross_profit += record.pnl;
        } else {
            self.gross_loss += -record.pnl;
        }

        // Welford
        let r = record.trade_return();
        let delta = r - self.ret_mean;
        self.ret_mean += delta / self.trades as f64;
        self.ret_m2 += delta * (r - self.ret_mean);

        self.cum_pnl += record.pnl;
        self.peak_pnl = self.peak_pnl.max(self.cum_pnl);
        self.max_drawdown = self.max_drawdown.max(self.peak_pnl - self.cum_pnl);
        self.last_updated = self.last_updated.max(record.closed_at);
    }

    fn summary(&self, strategy_id: &str, regime: RegimeKind) -> PerformanceSummary {
        let win_rate = if self.trades > 0 {
            self.wins as f64 / self.trades as f64
        } else {
            0.0
        };
        let profit_factor = if self.gross_loss > 0.0 {
            (self.gross_profit / self.gross_loss).min(PROFIT_FACTOR_CAP)
        } else if self.gross_profit > 0.0 {
            PROFIT_FACTOR_CAP
        } else {
            0.0
        };
        let vol_normalized_return = if self.trades >= 2 {
            let std = (self.ret_m2 / self.trades as f64).sqrt();
            if std > 0.0 {
                self.ret_mean / std
            } else {
                0.0
            }
        } else {
            0.0
        };

        PerformanceSummary {
            strategy_id: strategy_id.to_string(),
            regime,
            trade_count: self.trades,
            wins: self.wins,
            win_rate,
            gross_profit: self.gross_profit,
            gross_loss: self.gross_loss,
            profit_factor,
            vol_normalized_return,
            max_drawdown: self.max_drawdown,
            last_updated: self.last_updated,
        }
    }
}

type BucketKey = (String, RegimeKind);

#[derive(Default)]
pub struct PerformanceLedger {
    records: Vec<PerformanceRecord>,
    buckets: BTreeMap<BucketKey, BucketStats>,
    store: Option<LedgerStore>,
}

impl PerformanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from records in their original order.
    pub fn replay<I>(records: I) -> Self
    where
        I: IntoIterator<Item = PerformanceRecord>,
    {
        let mut ledger = Self::new();
        for record in records {
            ledger.apply(record);
        }
        ledger
    }

    /// Open a ledger backed by `store`, replaying everything it holds.
    pub fn with_store(store: LedgerStore) -> EngineResult<Self> {
        let records = store.load_all()?;
        let count = records.len();
        let mut ledger = Self::replay(records);
        ledger.store = Some(store);
        let digest = ledger.digest()?;
        log(
            Level::Info,
            Domain::Ledger,
            "replayed",
            obj(&[
                ("records", v_num(count as f64)),
                ("buckets", v_num(ledger.buckets.len() as f64)),
                ("digest", v_str(&digest)),
            ]),
        );
        Ok(ledger)
    }

    /// The only mutator.
    pub fn append(&mut self, record: PerformanceRecord) -> EngineResult<()> {
        record.validate()?;
        if let Some(store) = self.store.as_mut() {
            store.append(&record)?;
        }
        self.apply(record);
        Ok(())
    }

    fn apply(&mut self, record: PerformanceRecord) {
        self.buckets
            .entry((record.strategy_id.clone(), record.regime))
            .or_default()
            .apply(&record);
        self.records.push(record);
    }

    /// Summary for one bucket; an empty bucket reports zero trades.
    pub fn summary_for(&self, strategy_id: &str, regime: RegimeKind) -> PerformanceSummary {
        self.buckets
            .get(&(strategy_id.to_string(), regime))
            .map(|b| b.summary(strategy_id, regime))
            .unwrap_or_else(|| BucketStats::default().summary(strategy_id, regime))
    }

    pub fn trade_count(&self, strategy_id: &str, regime: RegimeKind) -> u64 {
        self.buckets
            .get(&(strategy_id.to_string(), regime))
            .map(|b| b.trades)
            .unwrap_or(0)
    }

    /// Every non-empty bucket, ordered by (strategy id, regime).
    pub fn summaries(&self) -> Vec<PerformanceSummary> {
        self.buckets
            .iter()
            .map(|((id, regime), stats)| stats.summary(id, *regime))
            .collect()
    }

    pub fn records(&self) -> &[PerformanceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Hex sha256 over the serialized summary table. Two ledgers with the
    /// same history produce the same digest.
    pub fn digest(&self) -> EngineResult<String> {
        let table = serde_json::to_string(&self.summaries()).map_err(|e| EngineError::Storage {
            reason: format!("summary table not serializable: {}", e),
        })?;
        Ok(hex::encode(Sha256::digest(table.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(strategy: &str, regime: RegimeKind, pnl: f64, closed_at: u64) -> PerformanceRecord {
        let entry = 100.0;
        let size = 1.0;
        PerformanceRecord {
            strategy_id: strategy.to_string(),
            symbol: "BTCUSDT".into(),
            regime,
            side: Side::Long,
            entry_price: entry,
            exit_price: entry + pnl / size,
            size,
            pnl,
            duration_ms: 60_000,
            outcome: Outcome::from_pnl(pnl),
            opened_at: closed_at.saturating_sub(60_000),
            closed_at,
            exit_reason: "strategy".into(),
        }
    }

    #[test]
    fn empty_bucket_is_neutral() {
        let ledger = PerformanceLedger::new();
        let s = ledger.summary_for("trend_long", RegimeKind::TrendingBullish);
        assert_eq!(s.trade_count, 0);
        assert_eq!(s.win_rate, 0.0);
        assert_eq!(s.profit_factor, 0.0);
    }

    #[test]
    fn append_updates_only_its_bucket() {
        let mut ledger = PerformanceLedger::new();
        ledger.append(record("a", RegimeKind::ChoppyCalm, 10.0, 1)).unwrap();
        ledger.append(record("a", RegimeKind::ChoppyCalm, -5.0, 2)).unwrap();
        ledger.append(record("b", RegimeKind::ChoppyCalm, 3.0, 3)).unwrap();

        let a = ledger.summary_for("a", RegimeKind::ChoppyCalm);
        assert_eq!(a.trade_count, 2);
        assert_eq!(a.wins, 1);
        assert!((a.win_rate - 0.5).abs() < 1e-12);
        assert!((a.profit_factor - 2.0).abs() < 1e-12);
        assert!((a.max_drawdown - 5.0).abs() < 1e-12);
        assert_eq!(a.last_updated, 2);

        assert_eq!(ledger.trade_count("a", RegimeKind::Breakout), 0);
        assert_eq!(ledger.summaries().len(), 2);
    }

    #[test]
    fn profit_factor_capped_without_losses() {
        let mut ledger = PerformanceLedger::new();
        ledger.append(record("a", RegimeKind::Breakout, 4.0, 1)).unwrap();
        let s = ledger.summary_for("a", RegimeKind::Breakout);
        assert_eq!(s.profit_factor, PROFIT_FACTOR_CAP);
    }

    #[test]
    fn breakeven_counts_as_loss() {
        assert_eq!(Outcome::from_pnl(0.0), Outcome::Loss);
    }

    #[test]
    fn malformed_record_rejected() {
        let mut ledger = PerformanceLedger::new();
        let mut bad = record("a", RegimeKind::ChoppyCalm, 1.0, 1);
        bad.pnl = f64::NAN;
        assert!(ledger.append(bad).is_err());
        let mut mislabeled = record("a", RegimeKind::ChoppyCalm, 1.0, 1);
        mislabeled.outcome = Outcome::Loss;
        assert!(ledger.append(mislabeled).is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn replay_reproduces_summaries_and_digest() {
        let mut ledger = PerformanceLedger::new();
        let pnls = [12.0, -3.0, 7.5, -9.0, 1.0, -0.5];
        for (i, pnl) in pnls.iter().enumerate() {
            let regime = if i % 2 == 0 { RegimeKind::ChoppyCalm } else { RegimeKind::TrendingBullish };
            ledger.append(record("a", regime, *pnl, i as u64)).unwrap();
        }
        let replayed = PerformanceLedger::replay(ledger.records().to_vec());
        assert_eq!(replayed.summaries(), ledger.summaries());
        assert_eq!(replayed.digest().unwrap(), ledger.digest().unwrap());
    }

    #[test]
    fn digest_covers_summary_table() {
        let mut ledger = PerformanceLedger::new();
        let empty = ledger.digest().unwrap();
        assert_eq!(empty, hex::encode(Sha256::digest(b"[]")));

        ledger.append(record("a", RegimeKind::Breakout, 2.0, 1)).unwrap();
        let one = ledger.digest().unwrap();
        assert_eq!(one.len(), 64);
        assert_ne!(one, empty);
    }

    fn arb_record() -> impl Strategy<Value = PerformanceRecord> {
        (
            prop::sample::select(vec!["alpha", "beta", "gamma"]),
            prop::sample::select(RegimeKind::ALL.to_vec()),
            -500i32..500,
            0u64..1_000_000,
        )
            .prop_map(|(id, regime, cents, ts)| record(id, regime, cents as f64 / 100.0, ts))
    }

    proptest! {
        #[test]
        fn replay_matches_incremental(records in prop::collection::vec(arb_record(), 0..60)) {
            let mut ledger = PerformanceLedger::new();
            for r in records.clone() {
                ledger.append(r).unwrap();
            }
            let replayed = PerformanceLedger::replay(records);
            prop_assert_eq!(replayed.summaries(), ledger.summaries());
        }

        #[test]
        fn bucket_order_does_not_change_rates(records in prop::collection::vec(arb_record(), 1..40)) {
            let forward = PerformanceLedger::replay(records.clone());
            let backward = PerformanceLedger::replay(records.into_iter().rev());
            let (f, b) = (forward.summaries(), backward.summaries());
            prop_assert_eq!(f.len(), b.len());
            for (x, y) in f.iter().zip(b.iter()) {
                prop_assert_eq!(x.trade_count, y.trade_count);
                prop_assert_eq!(x.wins, y.wins);
                prop_assert!((x.win_rate - y.win_rate).abs() < 1e-12);
                prop_assert!((x.profit_factor - y.profit_factor).abs() < 1e-9);
            }
        }

        #[test]
        fn trade_counts_are_additive(records in prop::collection::vec(arb_record(), 0..40)) {
            let ledger = PerformanceLedger::replay(records.clone());
            let total: u64 = ledger.summaries().iter().map(|s| s.trade_count).sum();
            prop_assert_eq!(total as usize, records.len());
        }
    }
}
