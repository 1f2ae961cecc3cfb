//! Rebuild the performance ledger from its sqlite file and print every
//! (strategy, regime) summary plus the ledger digest.
//!
//! Usage: `ledger_replay [path]` (defaults to `SQLITE_PATH`).

use anyhow::{bail, Result};
use serde_json::json;

use regimefx::ledger::PerformanceLedger;
use regimefx::storage::LedgerStore;

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SQLITE_PATH").ok())
        .unwrap_or_else(|| "./regimefx.sqlite".to_string());
    if !std::path::Path::new(&path).exists() {
        bail!("no ledger at {}", path);
    }

    let ledger = PerformanceLedger::with_store(LedgerStore::open(&path)?)?;
    let out = json!({
        "path": path,
        "records": ledger.len(),
        "summaries": ledger.summaries(),
        "digest": ledger.digest()?,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
