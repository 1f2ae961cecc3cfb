//! Process-wide risk gate.
//!
//! Every risk-taking transition asks the gate first. The gate is a two-state
//! machine:
//!
//! ```text
//!   Armed ──(trigger | Halt | desync)──▶ Halted ──(Reset)──▶ Armed
//! ```
//!
//! Entering `Halted` sets the kill switch and queues a force-flatten for
//! every symbol with an open position. While the kill switch is set no
//! `Intent::Open` is ever allowed. Nothing but an operator `Reset` leaves
//! `Halted`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::logging::{log, log_directive, log_gate_decision, log_halt, obj, v_num, v_str, Domain, Level};

pub type SharedGate = Arc<tokio::sync::Mutex<RiskGate>>;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub starting_capital: f64,
    /// Realized session loss, as a fraction of starting capital, that halts
    pub max_session_drawdown_frac: f64,
    pub max_consecutive_losses: u32,
    /// External health value below which the gate halts
    pub health_critical: f64,
    pub stale_after_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            starting_capital: 10_000.0,
            max_session_drawdown_frac: 0.05,
            max_consecutive_losses: 3,
            health_critical: 2.0,
            stale_after_ms: 180_000,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.starting_capital.is_finite() && self.starting_capital > 0.0) {
            return Err(EngineError::config("gate.starting_capital", "must be positive"));
        }
        if !(self.max_session_drawdown_frac > 0.0 && self.max_session_drawdown_frac <= 1.0) {
            return Err(EngineError::config(
                "gate.max_session_drawdown_frac",
                format!("must be in (0, 1], got {}", self.max_session_drawdown_frac),
            ));
        }
        if self.max_consecutive_losses == 0 {
            return Err(EngineError::config("gate.max_consecutive_losses", "must be at least 1"));
        }
        if !self.health_critical.is_finite() {
            return Err(EngineError::config("gate.health_critical", "must be finite"));
        }
        if self.stale_after_ms == 0 {
            return Err(EngineError::config("gate.stale_after_ms", "must be positive"));
        }
        Ok(())
    }
}

// =============================================================================
// Gate vocabulary
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Armed,
    Halted,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Armed => "armed",
            GateState::Halted => "halted",
        }
    }
}

/// Why the gate halted. Checked in declaration order; first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    SessionDrawdown,
    ConsecutiveLosses,
    HealthCritical,
    StaleData,
    Manual,
    PositionDesync,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::SessionDrawdown => "session_drawdown",
            Trigger::ConsecutiveLosses => "consecutive_losses",
            Trigger::HealthCritical => "health_critical",
            Trigger::StaleData => "stale_data",
            Trigger::Manual => "manual",
            Trigger::PositionDesync => "position_desync",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Open { symbol: String },
    Hold { symbol: String },
}

impl Intent {
    pub fn symbol(&self) -> &str {
        match self {
            Intent::Open { symbol } | Intent::Hold { symbol } => symbol,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Open { .. } => "open",
            Intent::Hold { .. } => "hold",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(String),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }
}

/// Operator commands accepted over the directive channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Halt,
    Reset,
    ForceFlattenAll,
    SessionBoundary,
}

impl Directive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Directive::Halt => "halt",
            Directive::Reset => "reset",
            Directive::ForceFlattenAll => "flatten",
            Directive::SessionBoundary => "session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "halt" => Some(Directive::Halt),
            "reset" => Some(Directive::Reset),
            "flatten" | "force_flatten_all" => Some(Directive::ForceFlattenAll),
            "session" | "session_boundary" => Some(Directive::SessionBoundary),
            _ => None,
        }
    }
}

/// Session counters owned by the gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskState {
    pub session_pnl: f64,
    pub consecutive_losses: u32,
    pub session_trades: u64,
    pub kill_switch: bool,
    pub last_snapshot_ts: u64,
    pub session_start_ts: u64,
}

// =============================================================================
// Gate
// =============================================================================

pub struct RiskGate {
    cfg: GateConfig,
    clock: Arc<dyn Clock>,
    state: RiskState,
    gate: GateState,
    trigger: Option<Trigger>,
    health: Option<f64>,
    open_symbols: BTreeSet<String>,
    pending_flatten: BTreeSet<String>,
}

impl RiskGate {
    pub fn new(cfg: GateConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            cfg,
            clock,
            state: RiskState {
                session_pnl: 0.0,
                consecutive_losses: 0,
                session_trades: 0,
                kill_switch: false,
                last_snapshot_ts: now,
                session_start_ts: now,
            },
            gate: GateState::Armed,
            trigger: None,
            health: None,
            open_symbols: BTreeSet::new(),
            pending_flatten: BTreeSet::new(),
        }
    }

    pub fn shared(self) -> SharedGate {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn config(&self) -> &GateConfig {
        &self.cfg
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn gate_state(&self) -> GateState {
        self.gate
    }

    pub fn trigger(&self) -> Option<Trigger> {
        self.trigger
    }

    pub fn kill_switch(&self) -> bool {
        self.state.kill_switch
    }

    /// Last finite health reading, if any.
    pub fn health(&self) -> Option<f64> {
        self.health
    }

    pub fn open_symbols(&self) -> Vec<String> {
        self.open_symbols.iter().cloned().collect()
    }

    pub fn flatten_pending(&self, symbol: &str) -> bool {
        self.pending_flatten.contains(symbol)
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    pub fn observe_snapshot(&mut self, ts: u64) {
        self.state.last_snapshot_ts = self.state.last_snapshot_ts.max(ts);
    }

    /// Latest external health value; `None` disables the health trigger.
    pub fn observe_health(&mut self, value: Option<f64>) {
        self.health = value.filter(|v| v.is_finite());
    }

    pub fn register_open(&mut self, symbol: &str) {
        self.open_symbols.insert(symbol.to_string());
    }

    pub fn unregister_open(&mut self, symbol: &str) {
        self.open_symbols.remove(symbol);
        self.pending_flatten.remove(symbol);
    }

    /// Fold a closed trade into the session counters, then re-check triggers.
    pub fn record_trade(&mut self, pnl: f64) -> Option<Trigger> {
        self.state.session_pnl += pnl;
        self.state.session_trades += 1;
        if pnl > 0.0 {
            self.state.consecutive_losses = 0;
        } else {
            self.state.consecutive_losses += 1;
        }
        self.evaluate()
    }

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------

    /// Check the automatic triggers. Returns the trigger that halted the gate
    /// on this call, if any.
    pub fn evaluate(&mut self) -> Option<Trigger> {
        if self.gate == GateState::Halted {
            return None;
        }
        let (trigger, detail) = self.first_trigger()?;
        self.halt(trigger, &detail);
        Some(trigger)
    }

    fn first_trigger(&self) -> Option<(Trigger, String)> {
        let limit = self.cfg.max_session_drawdown_frac * self.cfg.starting_capital;
        if self.state.session_pnl < 0.0 && -self.state.session_pnl >= limit {
            return Some((
                Trigger::SessionDrawdown,
                format!("session loss {:.2} >= limit {:.2}", -self.state.session_pnl, limit),
            ));
        }
        if self.state.consecutive_losses >= self.cfg.max_consecutive_losses {
            return Some((
                Trigger::ConsecutiveLosses,
                format!(
                    "{} consecutive losses >= {}",
                    self.state.consecutive_losses, self.cfg.max_consecutive_losses
                ),
            ));
        }
        if let Some(health) = self.health {
            if health < self.cfg.health_critical {
                return Some((
                    Trigger::HealthCritical,
                    format!("health {:.2} < critical {:.2}", health, self.cfg.health_critical),
                ));
            }
        }
        let age = self.clock.now_ms().saturating_sub(self.state.last_snapshot_ts);
        if age > self.cfg.stale_after_ms {
            return Some((
                Trigger::StaleData,
                format!("last snapshot {}ms ago > {}ms", age, self.cfg.stale_after_ms),
            ));
        }
        None
    }

    pub fn admit(&mut self, intent: &Intent) -> Admission {
        self.evaluate();
        let admission = self.decide(intent);
        let reason = match &admission {
            Admission::Allow => None,
            Admission::Deny(reason) => Some(reason.as_str()),
        };
        log_gate_decision(intent.symbol(), intent.as_str(), admission.is_allowed(), reason);
        admission
    }

    fn decide(&mut self, intent: &Intent) -> Admission {
        match intent {
            Intent::Open { symbol } => {
                if self.state.kill_switch {
                    return Admission::Deny(self.halt_reason());
                }
                if self.open_symbols.contains(symbol) {
                    return Admission::Deny("position already open".to_string());
                }
                Admission::Allow
            }
            Intent::Hold { symbol } => {
                if self.pending_flatten.remove(symbol) {
                    return Admission::Deny("force flatten".to_string());
                }
                if self.state.kill_switch {
                    return Admission::Deny(self.halt_reason());
                }
                Admission::Allow
            }
        }
    }

    fn halt_reason(&self) -> String {
        match self.trigger {
            Some(t) => format!("halted: {}", t),
            None => "halted".to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // State changes
    // -------------------------------------------------------------------------

    /// Enter `Halted`. A second halt keeps the first trigger.
    pub fn halt(&mut self, trigger: Trigger, detail: &str) {
        if self.gate == GateState::Halted {
            return;
        }
        self.gate = GateState::Halted;
        self.trigger = Some(trigger);
        self.state.kill_switch = true;
        self.pending_flatten.extend(self.open_symbols.iter().cloned());
        log_halt(trigger.as_str(), detail, &self.open_symbols());
    }

    /// Promote a lifecycle's fatal error to a global halt.
    pub fn desync(&mut self, symbol: &str, detail: &str) {
        self.halt(Trigger::PositionDesync, &format!("{}: {}", symbol, detail));
    }

    /// `Halted → Armed`. Session counters are kept.
    pub fn reset(&mut self) {
        if self.gate == GateState::Armed {
            return;
        }
        self.gate = GateState::Armed;
        self.trigger = None;
        self.state.kill_switch = false;
        self.state.consecutive_losses = 0;
    }

    pub fn session_boundary(&mut self) {
        let now = self.clock.now_ms();
        self.state.session_pnl = 0.0;
        self.state.session_trades = 0;
        self.state.consecutive_losses = 0;
        self.state.session_start_ts = now;
        self.state.last_snapshot_ts = self.state.last_snapshot_ts.max(now);
        log(
            Level::Info,
            Domain::Risk,
            "session_boundary",
            obj(&[
                ("session_start_ts", v_num(now as f64)),
                ("gate_state", v_str(self.gate.as_str())),
            ]),
        );
    }

    pub fn force_flatten_all(&mut self) {
        self.pending_flatten.extend(self.open_symbols.iter().cloned());
    }

    pub fn apply_directive(&mut self, directive: Directive) {
        match directive {
            Directive::Halt => self.halt(Trigger::Manual, "operator halt"),
            Directive::Reset => self.reset(),
            Directive::ForceFlattenAll => self.force_flatten_all(),
            Directive::SessionBoundary => self.session_boundary(),
        }
        log_directive(directive.as_str(), self.gate.as_str());
    }
}
