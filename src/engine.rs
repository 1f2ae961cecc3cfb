//! Orchestrator: one lifecycle task per symbol plus a directive task.
//!
//! The gate and ledger are shared across tasks. Directives are applied to
//! the gate as soon as they arrive; each symbol observes them on its next
//! cycle.

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use crate::error::{EngineError, EngineResult};
use crate::feed::{HealthSource, MarketFeed};
use crate::ledger::SharedLedger;
use crate::lifecycle::{CycleReport, ExecutionLifecycle, LifecycleContext};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::risk::{Directive, GateState, SharedGate};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    pub cycle_interval_ms: u64,
    pub snapshot_timeout_ms: u64,
    /// Stop each symbol after this many cycles; `None` runs until shutdown
    pub max_cycles: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            cycle_interval_ms: 1_000,
            snapshot_timeout_ms: 2_000,
            max_cycles: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.symbols.is_empty() {
            return Err(EngineError::config("engine.symbols", "at least one symbol required"));
        }
        let unique: BTreeSet<&String> = self.symbols.iter().collect();
        if unique.len() != self.symbols.len() {
            return Err(EngineError::config("engine.symbols", "duplicate symbol"));
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(EngineError::config("engine.symbols", "empty symbol"));
        }
        if self.cycle_interval_ms == 0 || self.snapshot_timeout_ms == 0 {
            return Err(EngineError::config("engine.cycle_interval_ms", "intervals must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolOutcome {
    pub symbol: String,
    pub cycles: u64,
    pub trades: u64,
    pub errors: u64,
    pub position_open: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub symbols: Vec<SymbolOutcome>,
    pub gate_state: GateState,
    pub kill_switch: bool,
    pub ledger_records: usize,
    pub ledger_digest: String,
}

pub struct Orchestrator {
    cfg: EngineConfig,
    ctx: LifecycleContext,
    feed: Arc<dyn MarketFeed>,
    health: Option<Arc<dyn HealthSource>>,
    reports: Option<mpsc::Sender<CycleReport>>,
}

impl Orchestrator {
    pub fn new(
        cfg: EngineConfig,
        ctx: LifecycleContext,
        feed: Arc<dyn MarketFeed>,
        health: Option<Arc<dyn HealthSource>>,
    ) -> Self {
        Self { cfg, ctx, feed, health, reports: None }
    }

    /// Forward every cycle report to `tx`.
    pub fn with_reports(mut self, tx: mpsc::Sender<CycleReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn gate(&self) -> SharedGate {
        self.ctx.gate.clone()
    }

    pub fn ledger(&self) -> SharedLedger {
        self.ctx.ledger.clone()
    }

    /// Run until every symbol finishes its cycles or `shutdown` turns true.
    pub async fn run(
        self,
        mut directives: mpsc::Receiver<Directive>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        self.cfg.validate()?;
        log(
            Level::Info,
            Domain::System,
            "engine_started",
            obj(&[
                ("symbols", v_str(&self.cfg.symbols.join(","))),
                ("strategies", v_num(self.ctx.registry.len() as f64)),
                ("cycle_interval_ms", v_num(self.cfg.cycle_interval_ms as f64)),
            ]),
        );

        let gate = self.ctx.gate.clone();
        let directive_task = tokio::spawn(async move {
            while let Some(directive) = directives.recv().await {
                gate.lock().await.apply_directive(directive);
            }
        });

        let mut handles = Vec::with_capacity(self.cfg.symbols.len());
        for symbol in &self.cfg.symbols {
            let task = SymbolTask {
                lifecycle: ExecutionLifecycle::new(symbol, self.ctx.clone()),
                feed: self.feed.clone(),
                health: self.health.clone(),
                gate: self.ctx.gate.clone(),
                cfg: self.cfg.clone(),
                reports: self.reports.clone(),
                shutdown: shutdown.clone(),
            };
            handles.push(tokio::spawn(task.run()));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(handle.await?);
        }
        directive_task.abort();

        let (gate_state, kill_switch) = {
            let gate = self.ctx.gate.lock().await;
            (gate.gate_state(), gate.kill_switch())
        };
        let (ledger_records, ledger_digest) = {
            let ledger = self.ctx.ledger.lock().await;
            (ledger.len(), ledger.digest()?)
        };
        log(
            Level::Info,
            Domain::System,
            "engine_stopped",
            obj(&[
                ("gate_state", v_str(gate_state.as_str())),
                ("ledger_records", v_num(ledger_records as f64)),
                ("ledger_digest", v_str(&ledger_digest)),
            ]),
        );
        Ok(RunSummary {
            symbols: outcomes,
            gate_state,
            kill_switch,
            ledger_records,
            ledger_digest,
        })
    }
}

struct SymbolTask {
    lifecycle: ExecutionLifecycle,
    feed: Arc<dyn MarketFeed>,
    health: Option<Arc<dyn HealthSource>>,
    gate: SharedGate,
    cfg: EngineConfig,
    reports: Option<mpsc::Sender<CycleReport>>,
    shutdown: watch::Receiver<bool>,
}

impl SymbolTask {
    async fn run(mut self) -> SymbolOutcome {
        let symbol = self.lifecycle.symbol().to_string();
        let limit = Duration::from_millis(self.cfg.snapshot_timeout_ms);
        let interval = Duration::from_millis(self.cfg.cycle_interval_ms);
        let mut outcome = SymbolOutcome {
            symbol: symbol.clone(),
            cycles: 0,
            trades: 0,
            errors: 0,
            position_open: false,
        };

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if self.cfg.max_cycles.is_some_and(|max| outcome.cycles >= max) {
                break;
            }

            let reading = match &self.health {
                Some(health) => match timeout(limit, health.poll()).await {
                    Ok(value) => Some(value),
                    Err(_) => {
                        // The gate keeps its last reading.
                        log(
                            Level::Warn,
                            Domain::Risk,
                            "health_timeout",
                            obj(&[
                                ("symbol", v_str(&symbol)),
                                ("timeout_ms", v_num(limit.as_millis() as f64)),
                            ]),
                        );
                        None
                    }
                },
                None => None,
            };
            {
                let mut gate = self.gate.lock().await;
                if let Some(value) = reading {
                    gate.observe_health(value);
                }
                gate.evaluate();
            }

            let report = match timeout(limit, self.feed.snapshot(&symbol)).await {
                Ok(Ok(snapshot)) => self.lifecycle.on_snapshot(&snapshot).await,
                Ok(Err(e)) => {
                    self.lifecycle
                        .on_missing_data(EngineError::insufficient(&symbol, e.to_string()))
                        .await
                }
                Err(_) => {
                    self.lifecycle
                        .on_missing_data(EngineError::insufficient(
                            &symbol,
                            format!("snapshot timed out after {}ms", limit.as_millis()),
                        ))
                        .await
                }
            };

            outcome.cycles += 1;
            if report.record.is_some() {
                outcome.trades += 1;
            }
            if report.error.is_some() {
                outcome.errors += 1;
            }
            log(
                Level::Debug,
                Domain::System,
                "cycle",
                obj(&[
                    ("symbol", v_str(&symbol)),
                    ("cycle", v_num(outcome.cycles as f64)),
                    ("state", v_str(report.state.as_str())),
                    ("transitions", v_num(report.transitions.len() as f64)),
                ]),
            );
            if let Some(tx) = &self.reports {
                let _ = tx.send(report).await;
            }

            tokio::select! {
                _ = sleep(interval) => {}
                changed = self.shutdown.changed() => {
                    // Sender gone: keep cycling on the interval.
                    if changed.is_err() {
                        sleep(interval).await;
                    }
                }
            }
        }

        outcome.position_open = self.lifecycle.position().is_some();
        outcome
    }
}
