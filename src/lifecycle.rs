//! Per-symbol execution lifecycle.
//!
//! ```text
//! Idle ─▶ Signaled ─▶ Gated ─▶ Open ─▶ Monitoring ─▶ Closing ─▶ Recorded ─▶ Idle
//!            │           │                              ▲
//!            └─ deny ────┴─ rejected ─▶ Idle            └─ stop | target | exit | forced
//! ```
//!
//! One lifecycle owns at most one position. Each cycle consumes one snapshot
//! (or a missing-data notice) and returns a `CycleReport`. Shared state (gate,
//! ledger) is locked only for the synchronous step that needs it; no lock is
//! held while an order call is in flight.

use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::exchange::retry::{retry_async, RetryConfig};
use crate::exchange::{CloseRequest, CloseStatus, Execution, OrderHandle, OrderRequest, OrderStatus};
use crate::ledger::{Outcome, PerformanceRecord, SharedLedger};
use crate::logging::{
    log, log_engine_error, log_order, log_regime, log_selection, log_trade, log_transition, obj, v_num,
    v_str, Domain, Level,
};
use crate::market::MarketSnapshot;
use crate::position::{protective_levels, Position, PositionStatus};
use crate::regime::{Regime, RegimeClassifier, RegimeKind};
use crate::risk::{Admission, Intent, SharedGate};
use crate::selector::{Selection, StrategySelector};
use crate::strategy::StrategyRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Signaled,
    Gated,
    Open,
    Monitoring,
    Closing,
    Recorded,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Signaled => "signaled",
            LifecycleState::Gated => "gated",
            LifecycleState::Open => "open",
            LifecycleState::Monitoring => "monitoring",
            LifecycleState::Closing => "closing",
            LifecycleState::Recorded => "recorded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Bound on every single order call (place, confirm, close, query)
    pub order_timeout_ms: u64,
    /// Confirmation polls before an unfilled entry is cancelled
    pub confirm_polls: u32,
    pub confirm_retry: RetryConfig,
    pub close_retry: RetryConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            order_timeout_ms: 5_000,
            confirm_polls: 3,
            confirm_retry: RetryConfig {
                max_retries: 3,
                base_delay_ms: 200,
                max_delay_ms: 2_000,
                jitter_factor: 0.2,
            },
            close_retry: RetryConfig::default(),
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.order_timeout_ms == 0 {
            return Err(EngineError::config("lifecycle.order_timeout_ms", "must be positive"));
        }
        if self.confirm_polls == 0 {
            return Err(EngineError::config("lifecycle.confirm_polls", "must be at least 1"));
        }
        self.confirm_retry.validate()?;
        self.close_retry.validate()
    }

    fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub cause: String,
}

/// What one cycle did for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub symbol: String,
    pub regime: Option<Regime>,
    pub strategy_id: Option<String>,
    pub admission: Option<Admission>,
    pub transitions: Vec<Transition>,
    pub record: Option<PerformanceRecord>,
    pub error: Option<EngineError>,
    /// State at the end of the cycle
    pub state: LifecycleState,
    pub position_open: bool,
}

impl CycleReport {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            regime: None,
            strategy_id: None,
            admission: None,
            transitions: Vec::new(),
            record: None,
            error: None,
            state: LifecycleState::Idle,
            position_open: false,
        }
    }

    pub fn passed_through(&self, state: LifecycleState) -> bool {
        self.transitions.iter().any(|t| t.to == state)
    }
}

/// Everything a lifecycle shares with its siblings.
#[derive(Clone)]
pub struct LifecycleContext {
    pub registry: Arc<StrategyRegistry>,
    pub classifier: Arc<RegimeClassifier>,
    pub selector: Arc<StrategySelector>,
    pub gate: SharedGate,
    pub ledger: SharedLedger,
    pub exec: Arc<dyn Execution>,
    pub clock: Arc<dyn Clock>,
    pub cfg: LifecycleConfig,
}

pub struct ExecutionLifecycle {
    symbol: String,
    ctx: LifecycleContext,
    state: LifecycleState,
    position: Option<Position>,
    last_price: Option<f64>,
    order_seq: u64,
}

impl ExecutionLifecycle {
    pub fn new(symbol: &str, ctx: LifecycleContext) -> Self {
        Self {
            symbol: symbol.to_string(),
            ctx,
            state: LifecycleState::Idle,
            position: None,
            last_price: None,
            order_seq: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    // =========================================================================
    // Cycle entry points
    // =========================================================================

    pub async fn on_snapshot(&mut self, snapshot: &MarketSnapshot) -> CycleReport {
        let mut report = CycleReport::new(&self.symbol);
        // Triggers see the gap before this snapshot refreshes the data clock.
        self.evaluate_gate().await;
        if snapshot.symbol != self.symbol {
            let err = EngineError::insufficient(&self.symbol, format!("received snapshot for {}", snapshot.symbol));
            return self.skip(err, report).await;
        }
        let regime = match self.ctx.classifier.classify(snapshot) {
            Ok(regime) => regime,
            Err(err) => return self.skip(err, report).await,
        };
        self.last_price = snapshot.price();
        self.ctx.gate.lock().await.observe_snapshot(snapshot.ts);
        log_regime(
            &self.symbol,
            regime.kind.as_str(),
            regime.confidence,
            serde_json::to_value(regime.indicators).unwrap_or(Value::Null),
        );
        report.regime = Some(regime);

        if self.position.is_some() {
            self.monitor(snapshot, &mut report).await;
        } else {
            self.seek_entry(snapshot, regime, &mut report).await;
        }
        self.finish(report)
    }

    /// The feed produced nothing usable this cycle.
    pub async fn on_missing_data(&mut self, err: EngineError) -> CycleReport {
        let report = CycleReport::new(&self.symbol);
        self.evaluate_gate().await;
        self.skip(err, report).await
    }

    async fn evaluate_gate(&self) {
        self.ctx.gate.lock().await.evaluate();
    }

    /// Skip the cycle. An open position still gets the gate's exit check.
    async fn skip(&mut self, err: EngineError, mut report: CycleReport) -> CycleReport {
        self.fail(err, &mut report);
        if self.position.is_some() {
            let admission = self.admit(Intent::Hold { symbol: self.symbol.clone() }).await;
            report.admission = Some(admission.clone());
            if let Admission::Deny(reason) = admission {
                let price = self
                    .last_price
                    .or_else(|| self.position.as_ref().map(|p| p.entry_price))
                    .unwrap_or_default();
                self.close_position(&format!("forced: {}", reason), price, &mut report).await;
            }
        }
        self.finish(report)
    }

    fn finish(&self, mut report: CycleReport) -> CycleReport {
        report.state = self.state;
        report.position_open = self.position.is_some();
        report
    }

    fn transition(&mut self, to: LifecycleState, cause: &str, report: &mut CycleReport) {
        let from = self.state;
        self.state = to;
        log_transition(&self.symbol, from.as_str(), to.as_str(), cause);
        report.transitions.push(Transition { from, to, cause: cause.to_string() });
    }

    fn fail(&self, err: EngineError, report: &mut CycleReport) {
        log_engine_error(&self.symbol, err.kind(), &err.to_string());
        report.error = Some(err);
    }

    async fn admit(&self, intent: Intent) -> Admission {
        self.ctx.gate.lock().await.admit(&intent)
    }

    // =========================================================================
    // Entry
    // =========================================================================

    async fn seek_entry(&mut self, snapshot: &MarketSnapshot, regime: Regime, report: &mut CycleReport) {
        let eligible = self.ctx.registry.list_eligible(regime.kind);
        let selection = {
            let ledger = self.ctx.ledger.lock().await;
            self.ctx.selector.select(regime.kind, &eligible, &ledger)
        };
        let selection = match selection {
            Some(selection) => selection,
            None => {
                log(
                    Level::Debug,
                    Domain::Strategy,
                    "no_candidate",
                    obj(&[("symbol", v_str(&self.symbol)), ("regime", v_str(regime.kind.as_str()))]),
                );
                return;
            }
        };
        log_selection(
            &self.symbol,
            regime.kind.as_str(),
            selection.strategy_id(),
            selection.basis.as_str(),
            selection.candidates,
        );
        report.strategy_id = Some(selection.strategy_id().to_string());

        if !selection.strategy.should_enter(snapshot) {
            return;
        }
        self.transition(LifecycleState::Signaled, "entry signal", report);

        let admission = self.admit(Intent::Open { symbol: self.symbol.clone() }).await;
        report.admission = Some(admission.clone());
        if let Admission::Deny(reason) = admission {
            self.transition(LifecycleState::Idle, &format!("denied: {}", reason), report);
            return;
        }
        self.transition(LifecycleState::Gated, "admitted", report);

        let position = match self.open_position(&selection, regime.kind, snapshot).await {
            Ok(position) => position,
            Err(err) => {
                if err.is_fatal() {
                    self.ctx.gate.lock().await.desync(&self.symbol, &err.to_string());
                }
                self.fail(err, report);
                self.transition(LifecycleState::Idle, "entry failed", report);
                return;
            }
        };

        let halted = {
            let mut gate = self.ctx.gate.lock().await;
            gate.register_open(&self.symbol);
            gate.kill_switch()
        };
        log_order(
            "order_filled",
            &self.symbol,
            &position.strategy_id,
            &position.handle.client_order_id,
            position.side.as_str(),
            position.size,
            position.entry_price,
        );
        let entry_price = position.entry_price;
        self.position = Some(position);
        if halted {
            // The gate halted while the order was in flight: never enter Open.
            self.close_position("forced: halted during entry", entry_price, report).await;
        } else {
            self.transition(LifecycleState::Open, "filled", report);
        }
    }

    async fn open_position(
        &mut self,
        selection: &Selection,
        regime: RegimeKind,
        snapshot: &MarketSnapshot,
    ) -> EngineResult<Position> {
        let strategy = &selection.strategy;
        let side = strategy.side();
        let params = strategy.risk_parameters();
        let price = snapshot
            .price()
            .ok_or_else(|| EngineError::insufficient(&self.symbol, "no reference price"))?;
        let capital = {
            let gate = self.ctx.gate.lock().await;
            gate.config().starting_capital + gate.state().session_pnl
        };
        let size = params.position_size_fraction * capital / price;
        if !(size.is_finite() && size > 0.0) {
            return Err(EngineError::insufficient(
                &self.symbol,
                format!("non-positive size from capital {:.2}", capital),
            ));
        }

        let (stop_price, target_price) = protective_levels(side, price, &params);
        self.order_seq += 1;
        let req = OrderRequest {
            symbol: self.symbol.clone(),
            side,
            size,
            reference_price: price,
            stop_price,
            target_price,
            client_order_id: format!(
                "{}-{}-{}-{}",
                self.symbol,
                strategy.id(),
                self.ctx.clock.now_ms(),
                self.order_seq
            ),
        };
        log_order("order_submitted", &self.symbol, strategy.id(), &req.client_order_id, side.as_str(), size, price);

        let (handle, fill_price) = self.place_and_confirm(&req).await?;
        // Protective levels follow the actual fill, not the decision price.
        let (stop_price, target_price) = protective_levels(side, fill_price, &params);
        Ok(Position {
            strategy_id: strategy.id().to_string(),
            symbol: self.symbol.clone(),
            side,
            entry_price: fill_price,
            size,
            stop_price,
            target_price,
            opened_at: self.ctx.clock.now_ms(),
            status: PositionStatus::Open,
            regime,
            handle,
        })
    }

    fn rejected(&self, req: &OrderRequest, reason: impl Into<String>) -> EngineError {
        EngineError::ExchangeRejected {
            symbol: req.symbol.clone(),
            side: req.side,
            reason: reason.into(),
        }
    }

    fn desync(&self, reason: impl Into<String>) -> EngineError {
        EngineError::PositionDesync {
            symbol: self.symbol.clone(),
            reason: reason.into(),
        }
    }

    /// Place the entry and resolve it to a fill. A placement timeout is
    /// ambiguous and is settled by looking the order up by client id.
    async fn place_and_confirm(&self, req: &OrderRequest) -> EngineResult<(OrderHandle, f64)> {
        let limit = self.ctx.cfg.order_timeout();
        let handle = match timeout(limit, self.ctx.exec.place_order(req)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(self.rejected(req, e.to_string())),
            Err(_) => {
                log(
                    Level::Warn,
                    Domain::Exec,
                    "order_timeout",
                    obj(&[
                        ("symbol", v_str(&self.symbol)),
                        ("client_order_id", v_str(&req.client_order_id)),
                        ("timeout_ms", v_num(limit.as_millis() as f64)),
                    ]),
                );
                match timeout(limit, self.ctx.exec.query_order(&req.symbol, &req.client_order_id)).await {
                    Ok(Ok(None)) => {
                        return Err(self.rejected(req, "placement timed out and venue has no such order"))
                    }
                    Ok(Ok(Some((_, OrderStatus::Rejected { reason })))) => return Err(self.rejected(req, reason)),
                    Ok(Ok(Some((handle, OrderStatus::Filled { price })))) => return Ok((handle, price)),
                    Ok(Ok(Some((handle, OrderStatus::Pending)))) => handle,
                    Ok(Ok(Some((_, OrderStatus::Closed { .. })))) => return Err(self.desync("entry already closed")),
                    Ok(Err(e)) => return Err(self.desync(format!("order status query failed: {}", e))),
                    Err(_) => return Err(self.desync("order status query timed out")),
                }
            }
        };
        self.await_fill(req, handle).await
    }

    async fn await_fill(&self, req: &OrderRequest, handle: OrderHandle) -> EngineResult<(OrderHandle, f64)> {
        let cfg = &self.ctx.cfg;
        let limit = cfg.order_timeout();
        for attempt in 0..cfg.confirm_polls {
            match timeout(limit, self.ctx.exec.confirm_order(&handle)).await {
                Ok(Ok(OrderStatus::Filled { price })) => return Ok((handle, price)),
                Ok(Ok(OrderStatus::Rejected { reason })) => return Err(self.rejected(req, reason)),
                Ok(Ok(OrderStatus::Pending)) => {}
                Ok(Ok(OrderStatus::Closed { .. })) => return Err(self.desync("entry already closed")),
                Ok(Err(e)) => log(
                    Level::Warn,
                    Domain::Exec,
                    "confirm_failed",
                    obj(&[("symbol", v_str(&self.symbol)), ("msg", v_str(&e.to_string()))]),
                ),
                Err(_) => log(
                    Level::Warn,
                    Domain::Exec,
                    "confirm_timeout",
                    obj(&[("symbol", v_str(&self.symbol)), ("client_order_id", v_str(&handle.client_order_id))]),
                ),
            }
            if attempt + 1 < cfg.confirm_polls {
                sleep(cfg.confirm_retry.delay_for_attempt(attempt)).await;
            }
        }

        // Still unfilled: pull it.
        let cancel = CloseRequest {
            symbol: req.symbol.clone(),
            side: req.side,
            size: req.size,
            reference_price: req.reference_price,
            handle: handle.clone(),
        };
        match timeout(limit, self.ctx.exec.close_order(&cancel)).await {
            Ok(Ok(CloseStatus::Rejected { .. })) | Ok(Ok(CloseStatus::Closed { .. })) => Err(self.rejected(
                req,
                format!("unconfirmed after {} polls, cancelled", cfg.confirm_polls),
            )),
            Ok(Ok(CloseStatus::Pending)) => Err(self.desync("entry neither filled nor cancelled")),
            Ok(Err(e)) => Err(self.desync(format!("cancel failed: {}", e))),
            Err(_) => Err(self.desync("cancel timed out")),
        }
    }

    // =========================================================================
    // Monitoring and exit
    // =========================================================================

    async fn monitor(&mut self, snapshot: &MarketSnapshot, report: &mut CycleReport) {
        let admission = self.admit(Intent::Hold { symbol: self.symbol.clone() }).await;
        report.admission = Some(admission.clone());
        let position = match &self.position {
            Some(position) => position.clone(),
            None => return,
        };
        report.strategy_id = Some(position.strategy_id.clone());
        if self.state == LifecycleState::Open {
            self.transition(LifecycleState::Monitoring, "next cycle", report);
        }

        let price = snapshot.price().unwrap_or(position.entry_price);
        // Forced exits first, then protective levels, then the strategy.
        let reason = if let Admission::Deny(reason) = &admission {
            Some(format!("forced: {}", reason))
        } else if position.status == PositionStatus::Closing {
            Some("close_retry".to_string())
        } else if position.stop_hit(price) {
            Some("stop".to_string())
        } else if position.target_hit(price) {
            Some("target".to_string())
        } else {
            match self.ctx.registry.get(&position.strategy_id) {
                Some(strategy) if strategy.should_exit(snapshot, &position) => Some("strategy".to_string()),
                Some(_) => None,
                None => Some("strategy_unregistered".to_string()),
            }
        };

        if let Some(reason) = reason {
            self.close_position(&reason, price, report).await;
        }
    }

    /// One close attempt. Anything short of a confirmed close is settled by
    /// looking the order up before another close may be sent: a venue that
    /// already flattened the position must never see a second close.
    async fn attempt_close(&self, req: &CloseRequest) -> anyhow::Result<f64> {
        let limit = self.ctx.cfg.order_timeout();
        let failure = match timeout(limit, self.ctx.exec.close_order(req)).await {
            Ok(Ok(CloseStatus::Closed { price })) => return Ok(price),
            Ok(Ok(CloseStatus::Pending)) => "close pending".to_string(),
            Ok(Ok(CloseStatus::Rejected { reason })) => format!("close rejected: {}", reason),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("close timed out after {}ms", limit.as_millis()),
        };
        log(
            Level::Warn,
            Domain::Exec,
            "close_unconfirmed",
            obj(&[
                ("symbol", v_str(&self.symbol)),
                ("client_order_id", v_str(&req.handle.client_order_id)),
                ("msg", v_str(&failure)),
            ]),
        );

        let cid = &req.handle.client_order_id;
        match timeout(limit, self.ctx.exec.query_order(&req.symbol, cid)).await {
            Ok(Ok(Some((_, OrderStatus::Closed { price })))) => Ok(price),
            Ok(Ok(Some((_, OrderStatus::Filled { .. })))) => Err(anyhow!(failure)),
            Ok(Ok(Some((_, status)))) => {
                Err(self.desync(format!("{}; order {} is {:?}", failure, cid, status)).into())
            }
            Ok(Ok(None)) => Err(self.desync(format!("{}; venue has no order {}", failure, cid)).into()),
            Ok(Err(e)) => Err(self.desync(format!("{}; status query failed: {}", failure, e)).into()),
            Err(_) => Err(self.desync(format!("{}; status query timed out", failure)).into()),
        }
    }

    async fn close_position(&mut self, reason: &str, price: f64, report: &mut CycleReport) {
        let position = match self.position.as_mut() {
            Some(position) => {
                position.status = PositionStatus::Closing;
                position.clone()
            }
            None => return,
        };
        if self.state != LifecycleState::Closing {
            self.transition(LifecycleState::Closing, reason, report);
        }

        let req = CloseRequest {
            symbol: self.symbol.clone(),
            side: position.side,
            size: position.size,
            reference_price: price,
            handle: position.handle.clone(),
        };
        log_order(
            "close_submitted",
            &self.symbol,
            &position.strategy_id,
            &position.handle.client_order_id,
            position.side.as_str(),
            position.size,
            price,
        );

        let closed = retry_async(
            &self.ctx.cfg.close_retry,
            "close_order",
            |_| self.attempt_close(&req),
            |e| e.downcast_ref::<EngineError>().map_or(true, |e| !e.is_fatal()),
        )
        .await;

        let exit_price = match closed {
            Ok(exit_price) => exit_price,
            Err(e) => {
                let err = match e.downcast::<EngineError>() {
                    Ok(err) => err,
                    Err(e) => self.desync(format!("close retries exhausted: {}", e)),
                };
                self.ctx.gate.lock().await.desync(&self.symbol, &err.to_string());
                self.fail(err, report);
                return;
            }
        };

        let now = self.ctx.clock.now_ms();
        let pnl = position.pnl_at(exit_price);
        let record = PerformanceRecord {
            strategy_id: position.strategy_id.clone(),
            symbol: self.symbol.clone(),
            regime: position.regime,
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            pnl,
            duration_ms: now.saturating_sub(position.opened_at),
            outcome: Outcome::from_pnl(pnl),
            opened_at: position.opened_at,
            closed_at: now,
            exit_reason: reason.to_string(),
        };
        log_order(
            "close_filled",
            &self.symbol,
            &position.strategy_id,
            &position.handle.client_order_id,
            position.side.as_str(),
            position.size,
            exit_price,
        );

        if let Err(err) = self.ctx.ledger.lock().await.append(record.clone()) {
            self.fail(err, report);
        }
        {
            let mut gate = self.ctx.gate.lock().await;
            gate.unregister_open(&self.symbol);
            gate.record_trade(pnl);
        }
        log_trade(&self.symbol, &record.strategy_id, record.regime.as_str(), pnl, reason);

        self.position = None;
        self.transition(LifecycleState::Recorded, "close confirmed", report);
        report.record = Some(record);
        self.transition(LifecycleState::Idle, "recorded", report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::paper::{CloseFault, EntryFault, PaperExecution};
    use crate::ledger::PerformanceLedger;
    use crate::market::{Candle, Indicators};
    use crate::risk::{Directive, GateConfig, GateState, RiskGate, Trigger};
    use crate::selector::SelectorConfig;
    use crate::strategies::{default_registry, StrategyConfig};

    const T0: u64 = 1_700_000_000_000;

    struct Rig {
        lifecycle: ExecutionLifecycle,
        paper: Arc<PaperExecution>,
        gate: SharedGate,
        ledger: SharedLedger,
        clock: Arc<ManualClock>,
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig { max_retries: 2, base_delay_ms: 1, max_delay_ms: 2, jitter_factor: 0.0 }
    }

    fn rig() -> Rig {
        rig_with(GateConfig::default())
    }

    fn rig_with(gate_cfg: GateConfig) -> Rig {
        let manual = Arc::new(ManualClock::new(T0));
        let clock: Arc<dyn Clock> = manual.clone();
        let paper = Arc::new(PaperExecution::new(0.0));
        let gate = RiskGate::new(gate_cfg, clock.clone()).shared();
        let ledger: SharedLedger = Arc::new(tokio::sync::Mutex::new(PerformanceLedger::new()));
        let ctx = LifecycleContext {
            registry: Arc::new(default_registry(&StrategyConfig::default()).unwrap()),
            classifier: Arc::new(RegimeClassifier::default()),
            selector: Arc::new(StrategySelector::new(SelectorConfig::default())),
            gate: gate.clone(),
            ledger: ledger.clone(),
            exec: paper.clone(),
            clock,
            cfg: LifecycleConfig {
                order_timeout_ms: 30,
                confirm_polls: 2,
                confirm_retry: fast_retry(),
                close_retry: fast_retry(),
            },
        };
        Rig { lifecycle: ExecutionLifecycle::new("BTCUSDT", ctx), paper, gate, ledger, clock: manual }
    }

    /// Trending-bullish snapshot: fast average one below price, slow three below.
    fn bullish(price: f64, momentum: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".into(),
            ts: T0,
            candles: vec![Candle { ts: T0, o: price, h: price, l: price, c: price, v: 1.0 }],
            indicators: Indicators {
                trend_strength: 40.0,
                volatility_range: 0.01,
                volatility_percentile: 0.5,
                ma_fast: price - 1.0,
                ma_slow: price - 3.0,
                momentum,
                band_width: 0.05,
                band_width_mean: 0.05,
                band_width_std: 0.01,
            },
        }
    }

    #[tokio::test]
    async fn entry_then_target_exit_records_trade() {
        let mut rig = rig();
        let report = rig.lifecycle.on_snapshot(&bullish(100.0, 60.0)).await;
        assert_eq!(report.regime.map(|r| r.kind), Some(RegimeKind::TrendingBullish));
        assert_eq!(report.strategy_id.as_deref(), Some("trend_long"));
        assert!(report.passed_through(LifecycleState::Signaled));
        assert!(report.passed_through(LifecycleState::Gated));
        assert_eq!(report.state, LifecycleState::Open);

        let position = rig.lifecycle.position().unwrap().clone();
        assert!((position.size - 10.0).abs() < 1e-9);
        assert!((position.stop_price - 98.0).abs() < 1e-9);
        assert!((position.target_price - 105.0).abs() < 1e-9);
        assert_eq!(rig.gate.lock().await.open_symbols(), vec!["BTCUSDT".to_string()]);

        let report = rig.lifecycle.on_snapshot(&bullish(106.0, 60.0)).await;
        let record = report.record.clone().unwrap();
        assert_eq!(record.exit_reason, "target");
        assert!((record.pnl - 60.0).abs() < 1e-9);
        assert_eq!(report.state, LifecycleState::Idle);
        assert!(report.passed_through(LifecycleState::Monitoring));
        assert!(report.passed_through(LifecycleState::Recorded));
        assert!(!report.position_open);
        assert_eq!(rig.ledger.lock().await.len(), 1);
        assert!(rig.gate.lock().await.open_symbols().is_empty());
        assert_eq!(rig.paper.open_orders(), 0);
    }

    #[tokio::test]
    async fn placement_timeout_returns_to_idle_without_position() {
        let mut rig = rig();
        rig.paper.script_entry(EntryFault::Hang).unwrap();
        let report = rig.lifecycle.on_snapshot(&bullish(100.0, 60.0)).await;

        assert!(matches!(report.error, Some(EngineError::ExchangeRejected { .. })));
        assert_eq!(report.state, LifecycleState::Idle);
        assert!(rig.lifecycle.position().is_none());
        assert!(report.record.is_none());
        assert!(rig.ledger.lock().await.is_empty());
        assert!(rig.gate.lock().await.open_symbols().is_empty());
        assert_eq!(rig.paper.order_count(), 0);
    }

    #[tokio::test]
    async fn late_ack_resolved_by_client_id() {
        let mut rig = rig();
        rig.paper.script_entry(EntryFault::LateAck).unwrap();
        let report = rig.lifecycle.on_snapshot(&bullish(100.0, 60.0)).await;
        assert!(report.error.is_none());
        assert_eq!(report.state, LifecycleState::Open);
        assert!(rig.lifecycle.position().is_some());
    }

    #[tokio::test]
    async fn unfilled_entry_is_cancelled() {
        let mut rig = rig();
        rig.paper.script_entry(EntryFault::Pending).unwrap();
        let report = rig.lifecycle.on_snapshot(&bullish(100.0, 60.0)).await;
        assert!(matches!(report.error, Some(EngineError::ExchangeRejected { .. })));
        assert!(rig.lifecycle.position().is_none());
        assert_eq!(rig.paper.open_orders(), 0);
    }

    #[tokio::test]
    async fn halt_forces_exit_within_one_cycle() {
        let mut rig = rig();
        rig.lifecycle.on_snapshot(&bullish(100.0, 60.0)).await;
        assert!(rig.lifecycle.position().is_some());

        rig.gate.lock().await.apply_directive(Directive::Halt);
        // Nothing in this snapshot would exit on its own.
        let report = rig.lifecycle.on_snapshot(&bullish(101.0, 60.0)).await;
        assert!(matches!(report.admission, Some(Admission::Deny(_))));
        let record = report.record.unwrap();
        assert!(record.exit_reason.starts_with("forced"));
        assert!(rig.lifecycle.position().is_none());

        // Still halted: the next entry signal is denied.
        let report = rig.lifecycle.on_snapshot(&bullish(101.0, 60.0)).await;
        assert!(report.passed_through(LifecycleState::Signaled));
        assert!(!report.passed_through(LifecycleState::Gated));
        assert!(rig.lifecycle.position().is_none());
    }

    #[tokio::test]
    async fn missing_data_still_honours_forced_exit() {
        let mut rig = rig();
        rig.lifecycle.on_snapshot(&bullish(100.0, 60.0)).await;
        rig.gate.lock().await.apply_directive(Directive::ForceFlattenAll);

        let report = rig
            .lifecycle
            .on_missing_data(EngineError::insufficient("BTCUSDT", "snapshot timed out"))
            .await;
        assert!(report.record.is_some());
        assert!(rig.lifecycle.position().is_none());
    }

    #[tokio::test]
    async fn exhausted_close_is_a_global_desync() {
        let mut rig = rig();
        rig.lifecycle.on_snapshot(&bullish(100.0, 60.0)).await;
        for _ in 0..3 {
            rig.paper.script_close(CloseFault::Error).unwrap();
        }

        let report = rig.lifecycle.on_snapshot(&bullish(97.0, 60.0)).await;
        assert!(matches!(report.error, Some(EngineError::PositionDesync { .. })));
        assert_eq!(report.state, LifecycleState::Closing);
        assert_eq!(rig.gate.lock().await.trigger(), Some(Trigger::PositionDesync));
        assert_eq!(rig.lifecycle.position().map(|p| p.status), Some(PositionStatus::Closing));

        // Next cycle retries the close and succeeds.
        let report = rig.lifecycle.on_snapshot(&bullish(97.0, 60.0)).await;
        assert!(report.record.is_some());
        assert!(rig.lifecycle.position().is_none());
    }

    #[tokio::test]
    async fn late_close_ack_is_not_closed_twice() {
        let mut rig = rig();
        rig.lifecycle.on_snapshot(&bullish(100.0, 60.0)).await;
        rig.paper.script_close(CloseFault::LateAck).unwrap();

        let report = rig.lifecycle.on_snapshot(&bullish(106.0, 60.0)).await;
        assert!(report.error.is_none(), "{:?}", report.error);
        let record = report.record.unwrap();
        assert_eq!(record.exit_reason, "target");
        assert!((record.exit_price - 106.0).abs() < 1e-9);
        assert_eq!(rig.paper.close_calls(), 1);
        assert!(rig.lifecycle.position().is_none());
        assert_eq!(rig.ledger.lock().await.len(), 1);
        assert_eq!(rig.gate.lock().await.gate_state(), GateState::Armed);
    }

    #[tokio::test]
    async fn rejected_close_of_open_order_is_retried() {
        let mut rig = rig();
        rig.lifecycle.on_snapshot(&bullish(100.0, 60.0)).await;
        rig.paper.script_close(CloseFault::Reject).unwrap();

        let report = rig.lifecycle.on_snapshot(&bullish(106.0, 60.0)).await;
        assert!(report.record.is_some());
        assert_eq!(rig.paper.close_calls(), 2);
        assert_eq!(rig.paper.open_orders(), 0);
    }

    #[tokio::test]
    async fn stale_feed_halts_idle_symbol() {
        let mut rig = rig_with(GateConfig { stale_after_ms: 5_000, ..Default::default() });
        for _ in 0..10 {
            rig.clock.advance(60_000);
            rig.lifecycle
                .on_missing_data(EngineError::insufficient("BTCUSDT", "snapshot timed out"))
                .await;
        }
        {
            let gate = rig.gate.lock().await;
            assert_eq!(gate.gate_state(), GateState::Halted);
            assert_eq!(gate.trigger(), Some(Trigger::StaleData));
        }

        let mut fresh = bullish(100.0, 60.0);
        fresh.ts = rig.clock.now_ms();
        let report = rig.lifecycle.on_snapshot(&fresh).await;
        assert!(matches!(report.admission, Some(Admission::Deny(_))));
        assert!(rig.lifecycle.position().is_none());
        assert_eq!(rig.paper.order_count(), 0);
    }

    #[tokio::test]
    async fn data_gap_halts_before_next_entry() {
        let mut rig = rig_with(GateConfig { stale_after_ms: 5_000, ..Default::default() });
        rig.clock.advance(600_000);

        let mut fresh = bullish(100.0, 60.0);
        fresh.ts = rig.clock.now_ms();
        let report = rig.lifecycle.on_snapshot(&fresh).await;
        assert!(!report.passed_through(LifecycleState::Gated));
        assert!(rig.lifecycle.position().is_none());
        assert_eq!(rig.gate.lock().await.trigger(), Some(Trigger::StaleData));
    }

    #[tokio::test]
    async fn invalid_snapshot_skips_cycle() {
        let mut rig = rig();
        let mut snap = bullish(100.0, 60.0);
        snap.indicators.momentum = f64::NAN;
        let report = rig.lifecycle.on_snapshot(&snap).await;
        assert!(matches!(report.error, Some(EngineError::InsufficientData { .. })));
        assert!(report.transitions.is_empty());
        assert!(report.regime.is_none());
    }

    #[tokio::test]
    async fn weak_momentum_does_not_enter() {
        let mut rig = rig();
        let report = rig.lifecycle.on_snapshot(&bullish(100.0, 50.0)).await;
        assert_eq!(report.strategy_id.as_deref(), Some("trend_long"));
        assert!(report.transitions.is_empty());
        assert_eq!(report.state, LifecycleState::Idle);
    }
}
