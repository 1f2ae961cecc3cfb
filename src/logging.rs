//! Structured logging for the orchestration loop.
//!
//! Every cycle emits one record per decision point (regime, selection, gate
//! decision, transition) so external alerting can follow a symbol without
//! reading engine state. Records are JSON lines:
//!
//! ```text
//! {"ts":..,"run_id":..,"seq":..,"lvl":"INFO","component":"risk","event":"gate",
//!  "msg":"","symbol":"BTCUSDT","data":{..}}
//! ```
//!
//! Environment:
//! - `LOG_LEVEL`   trace|debug|info|warn|error|fatal (default info)
//! - `LOG_DOMAINS` comma-separated domains or `all`
//! - `LOG_DIR`     run directory root (default `out/runs`), `off` disables files
//! - `LOG_STDOUT`  `0` silences stdout
//! - `RUN_ID`      fixed run id for replay correlation

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Market,   // Snapshots, missing data
    Regime,   // Classification output
    Strategy, // Selection, entry/exit signals
    Risk,     // Gate decisions, halts, directives
    Exec,     // Order placement, confirmation, close
    Ledger,   // Trade records, summaries, replay
    System,   // Startup, shutdown, config
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Regime => "regime",
            Domain::Strategy => "strategy",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Ledger => "ledger",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    stdout: bool,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let stdout = !matches!(std::env::var("LOG_STDOUT").as_deref(), Ok("0") | Ok("false"));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        if base == "off" {
            return RunContext { run_id, stdout, events: None, trace: None };
        }

        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext { run_id, stdout, events: None, trace: None };
        }
        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
            stdout,
        }
    })
}

pub fn run_id() -> &'static str {
    &ensure_run_context().run_id
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["symbol", "strategy_id", "client_order_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.stdout {
        println!("{}", line);
    }
}

// =============================================================================
// Decision-point logs (one per cycle stage)
// =============================================================================

pub fn log_regime(symbol: &str, regime: &str, confidence: f64, indicators: Value) {
    log(
        Level::Info,
        Domain::Regime,
        "classified",
        obj(&[
            ("symbol", v_str(symbol)),
            ("regime", v_str(regime)),
            ("confidence", v_num(confidence)),
            ("indicators", indicators),
        ]),
    );
}

pub fn log_selection(symbol: &str, regime: &str, strategy_id: &str, basis: &str, candidates: usize) {
    log(
        Level::Info,
        Domain::Strategy,
        "selected",
        obj(&[
            ("symbol", v_str(symbol)),
            ("strategy_id", v_str(strategy_id)),
            ("regime", v_str(regime)),
            ("basis", v_str(basis)),
            ("candidates", json!(candidates)),
        ]),
    );
}

pub fn log_gate_decision(symbol: &str, intent: &str, allowed: bool, reason: Option<&str>) {
    log(
        if allowed { Level::Debug } else { Level::Warn },
        Domain::Risk,
        "gate",
        obj(&[
            ("symbol", v_str(symbol)),
            ("intent", v_str(intent)),
            ("decision", v_str(if allowed { "allow" } else { "deny" })),
            ("reason", reason.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_transition(symbol: &str, from: &str, to: &str, cause: &str) {
    log(
        Level::Info,
        Domain::Strategy,
        "transition",
        obj(&[
            ("symbol", v_str(symbol)),
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("cause", v_str(cause)),
        ]),
    );
}

pub fn log_halt(trigger: &str, detail: &str, flatten: &[String]) {
    log(
        Level::Error,
        Domain::Risk,
        "halted",
        obj(&[
            ("msg", v_str(detail)),
            ("trigger", v_str(trigger)),
            ("flatten", json!(flatten)),
        ]),
    );
}

pub fn log_directive(directive: &str, gate_state: &str) {
    log(
        Level::Warn,
        Domain::Risk,
        "directive",
        obj(&[
            ("directive", v_str(directive)),
            ("gate_state", v_str(gate_state)),
        ]),
    );
}

pub fn log_order(
    event: &str,
    symbol: &str,
    strategy_id: &str,
    client_order_id: &str,
    side: &str,
    size: f64,
    price: f64,
) {
    log(
        Level::Info,
        Domain::Exec,
        event,
        obj(&[
            ("symbol", v_str(symbol)),
            ("strategy_id", v_str(strategy_id)),
            ("client_order_id", v_str(client_order_id)),
            ("side", v_str(side)),
            ("size", v_num(size)),
            ("price", v_num(price)),
        ]),
    );
}

pub fn log_trade(symbol: &str, strategy_id: &str, regime: &str, pnl: f64, exit_reason: &str) {
    log(
        Level::Info,
        Domain::Ledger,
        "trade_recorded",
        obj(&[
            ("symbol", v_str(symbol)),
            ("strategy_id", v_str(strategy_id)),
            ("regime", v_str(regime)),
            ("pnl", v_num(pnl)),
            ("exit_reason", v_str(exit_reason)),
        ]),
    );
}

pub fn log_engine_error(symbol: &str, kind: &str, detail: &str) {
    let level = if kind == "position_desync" { Level::Fatal } else { Level::Error };
    log(
        level,
        Domain::System,
        "error",
        obj(&[
            ("symbol", v_str(symbol)),
            ("msg", v_str(detail)),
            ("kind", v_str(kind)),
        ]),
    );
}

// =============================================================================
// Field builders
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}
