use rusqlite::{params, Connection};
use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::ledger::{Outcome, PerformanceRecord};
use crate::market::Side;
use crate::regime::RegimeKind;

/// Durable, append-only home of the performance ledger.
///
/// Row order (`seq`) is ledger order; `load_all` returns records in that
/// order so a replay reproduces every summary.
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let mut store = Self { conn: Connection::open(path)? };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> EngineResult<Self> {
        let mut store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> EngineResult<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS performance_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                regime TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                size REAL NOT NULL,
                pnl REAL NOT NULL,
                duration_ms INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER NOT NULL,
                exit_reason TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn append(&mut self, r: &PerformanceRecord) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO performance_records
                (strategy_id, symbol, regime, side, entry_price, exit_price, size, pnl,
                 duration_ms, outcome, opened_at, closed_at, exit_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                r.strategy_id,
                r.symbol,
                r.regime.as_str(),
                r.side.as_str(),
                r.entry_price,
                r.exit_price,
                r.size,
                r.pnl,
                r.duration_ms as i64,
                r.outcome.as_str(),
                r.opened_at as i64,
                r.closed_at as i64,
                r.exit_reason,
            ],
        )?;
        Ok(())
    }

    pub fn load_all(&self) -> EngineResult<Vec<PerformanceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT strategy_id, symbol, regime, side, entry_price, exit_price, size, pnl,
                    duration_ms, outcome, opened_at, closed_at, exit_reason
             FROM performance_records ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RawRow {
                strategy_id: row.get(0)?,
                symbol: row.get(1)?,
                regime: row.get(2)?,
                side: row.get(3)?,
                entry_price: row.get(4)?,
                exit_price: row.get(5)?,
                size: row.get(6)?,
                pnl: row.get(7)?,
                duration_ms: row.get(8)?,
                outcome: row.get(9)?,
                opened_at: row.get(10)?,
                closed_at: row.get(11)?,
                exit_reason: row.get(12)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }

    pub fn count(&self) -> EngineResult<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM performance_records", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

struct RawRow {
    strategy_id: String,
    symbol: String,
    regime: String,
    side: String,
    entry_price: f64,
    exit_price: f64,
    size: f64,
    pnl: f64,
    duration_ms: i64,
    outcome: String,
    opened_at: i64,
    closed_at: i64,
    exit_reason: String,
}

impl RawRow {
    fn into_record(self) -> EngineResult<PerformanceRecord> {
        let corrupt = |field: &str, value: &str| EngineError::Storage {
            reason: format!("unknown {} '{}' in performance_records", field, value),
        };
        let regime = RegimeKind::parse(&self.regime).ok_or_else(|| corrupt("regime", &self.regime))?;
        let side = match self.side.as_str() {
            "long" => Side::Long,
            "short" => Side::Short,
            other => return Err(corrupt("side", other)),
        };
        let outcome = match self.outcome.as_str() {
            "win" => Outcome::Win,
            "loss" => Outcome::Loss,
            other => return Err(corrupt("outcome", other)),
        };
        Ok(PerformanceRecord {
            strategy_id: self.strategy_id,
            symbol: self.symbol,
            regime,
            side,
            entry_price: self.entry_price,
            exit_price: self.exit_price,
            size: self.size,
            pnl: self.pnl,
            duration_ms: self.duration_ms.max(0) as u64,
            outcome,
            opened_at: self.opened_at.max(0) as u64,
            closed_at: self.closed_at.max(0) as u64,
            exit_reason: self.exit_reason,
        })
    }
}
