//! Paper-trading runner.
//!
//! Drives every configured symbol off the synthetic feed into the paper
//! venue. Operator directives are read line by line from stdin:
//!
//! ```text
//! halt | reset | flatten | session   gate directives
//! health <value> | health off        external health signal
//! status                             log gate state and ledger digest
//! quit                               stop after the current cycle
//! ```

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use regimefx::clock::{Clock, SystemClock};
use regimefx::config::Config;
use regimefx::engine::Orchestrator;
use regimefx::exchange::paper::PaperExecution;
use regimefx::feed::{HealthSource, ManualHealth, SyntheticFeed};
use regimefx::ledger::{PerformanceLedger, SharedLedger};
use regimefx::lifecycle::LifecycleContext;
use regimefx::logging::{log, log_engine_error, obj, v_num, v_str, Domain, Level};
use regimefx::regime::RegimeClassifier;
use regimefx::risk::{Directive, RiskGate, SharedGate};
use regimefx::selector::StrategySelector;
use regimefx::storage::LedgerStore;
use regimefx::strategies::default_registry;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    if let Err(e) = cfg.validate() {
        log_engine_error("-", e.kind(), &e.to_string());
        return Err(e.into());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = if cfg.sqlite_path == ":memory:" {
        LedgerStore::in_memory()?
    } else {
        LedgerStore::open(&cfg.sqlite_path)?
    };
    let ledger: SharedLedger = Arc::new(tokio::sync::Mutex::new(PerformanceLedger::with_store(store)?));
    let gate = RiskGate::new(cfg.gate.clone(), clock.clone()).shared();
    let registry = Arc::new(default_registry(&cfg.strategies)?);

    let ctx = LifecycleContext {
        registry,
        classifier: Arc::new(RegimeClassifier::new(cfg.classifier.clone())),
        selector: Arc::new(StrategySelector::new(cfg.selector.clone())),
        gate: gate.clone(),
        ledger: ledger.clone(),
        exec: Arc::new(PaperExecution::with_faults(cfg.paper_slip, cfg.faults.clone())),
        clock: clock.clone(),
        cfg: cfg.lifecycle.clone(),
    };
    let feed = Arc::new(SyntheticFeed::new(cfg.synthetic.clone(), cfg.indicators.clone(), clock));
    let health = ManualHealth::new(cfg.health_initial);
    let health_source: Arc<dyn HealthSource> = Arc::new(health.clone());

    log(
        Level::Info,
        Domain::System,
        "config",
        obj(&[
            ("symbols", v_str(&cfg.engine.symbols.join(","))),
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("starting_capital", v_num(cfg.gate.starting_capital)),
            ("max_session_drawdown_frac", v_num(cfg.gate.max_session_drawdown_frac)),
            ("max_consecutive_losses", v_num(cfg.gate.max_consecutive_losses as f64)),
            ("min_trades", v_num(cfg.selector.min_trades as f64)),
        ]),
    );

    let (directive_tx, directive_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::new(cfg.engine.clone(), ctx, feed, Some(health_source));

    let console = tokio::spawn(operator_console(directive_tx, shutdown_tx, health, gate, ledger));
    let summary = orchestrator.run(directive_rx, shutdown_rx).await?;
    console.abort();

    for outcome in &summary.symbols {
        log(
            Level::Info,
            Domain::System,
            "symbol_summary",
            obj(&[
                ("symbol", v_str(&outcome.symbol)),
                ("cycles", v_num(outcome.cycles as f64)),
                ("trades", v_num(outcome.trades as f64)),
                ("errors", v_num(outcome.errors as f64)),
                ("position_open", v_str(if outcome.position_open { "true" } else { "false" })),
            ]),
        );
    }
    Ok(())
}

async fn operator_console(
    directives: mpsc::Sender<Directive>,
    shutdown: watch::Sender<bool>,
    health: ManualHealth,
    gate: SharedGate,
    ledger: SharedLedger,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // EOF leaves the engine running; only `quit` stops it.
    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            continue;
        };
        match cmd {
            "quit" | "exit" => {
                let _ = shutdown.send(true);
                return;
            }
            "health" => {
                let value = match parts.next() {
                    Some("off") | None => None,
                    Some(raw) => match raw.parse::<f64>() {
                        Ok(v) if v.is_finite() => Some(v),
                        _ => {
                            log(Level::Warn, Domain::System, "console", obj(&[("rejected", v_str(&line))]));
                            continue;
                        }
                    },
                };
                health.set(value);
                log(
                    Level::Info,
                    Domain::Risk,
                    "health_set",
                    obj(&[("value", value.map(v_num).unwrap_or(serde_json::Value::Null))]),
                );
            }
            "status" => {
                let (state, gate_state, open) = {
                    let g = gate.lock().await;
                    (g.state().clone(), g.gate_state(), g.open_symbols())
                };
                let digest = match ledger.lock().await.digest() {
                    Ok(digest) => digest,
                    Err(e) => {
                        log(Level::Error, Domain::Ledger, "digest_failed", obj(&[("msg", v_str(&e.to_string()))]));
                        continue;
                    }
                };
                log(
                    Level::Info,
                    Domain::System,
                    "status",
                    obj(&[
                        ("gate_state", v_str(gate_state.as_str())),
                        ("session_pnl", v_num(state.session_pnl)),
                        ("consecutive_losses", v_num(state.consecutive_losses as f64)),
                        ("open", v_str(&open.join(","))),
                        ("ledger_digest", v_str(&digest)),
                    ]),
                );
            }
            other => match Directive::parse(other) {
                Some(d) => {
                    if directives.send(d).await.is_err() {
                        return;
                    }
                }
                None => log(Level::Warn, Domain::System, "console", obj(&[("rejected", v_str(&line))])),
            },
        }
    }
}
