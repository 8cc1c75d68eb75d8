//! Structured logging for the governed pipeline.
//!
//! Every line is one JSON object written to the run directory and stdout:
//! 1. Levels (TRACE → FATAL) filtered by `LOG_LEVEL`
//! 2. Domains filtered by `LOG_DOMAINS`
//! 3. A process-wide `seq` so audit tooling can order lines without clocks
//! 4. Secret fields redacted before anything is written

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

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => Err(format!("unknown log level {}", other)),
        }
    }
}

impl Level {
    /// `LOG_LEVEL`, read once per process; info when unset or unparseable.
    pub fn threshold() -> Self {
        static THRESHOLD: OnceLock<Level> = OnceLock::new();
        *THRESHOLD.get_or_init(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Level::Info)
        })
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
    Orchestrator, // Profile selection, layer runs
    Evidence,     // Pack finalization, schema validation
    Risk,         // Gate checks and decisions
    Exec,         // Order lifecycle
    Reconcile,    // Venue alignment
    KillSwitch,   // Halt authority
    Replay,       // Determinism comparisons
    System,       // Startup, shutdown, recovery
    Audit,        // Persisted reason codes
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Orchestrator => "orchestrator",
            Domain::Evidence => "evidence",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Reconcile => "reconcile",
            Domain::KillSwitch => "kill_switch",
            Domain::Replay => "replay",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }

    /// `LOG_DOMAINS` is a comma list; unset or `all` enables everything.
    pub fn is_enabled(&self) -> bool {
        static ENABLED: OnceLock<Option<Vec<String>>> = OnceLock::new();
        let enabled = ENABLED.get_or_init(|| match std::env::var("LOG_DOMAINS") {
            Ok(v) if v.trim() != "all" => Some(v.split(',').map(|d| d.trim().to_string()).collect()),
            _ => None,
        });
        match enabled {
            None => true,
            Some(list) => list.iter().any(|d| d == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

/// Keys whose values never reach a log line.
const REDACTED_KEYS: &[&str] = &["authorization", "Authorization", "api_key", "operator_token", "operator_secret"];

/// Correlation keys lifted out of `data` onto the top level of each line.
const PROMOTED_KEYS: &[&str] = &["run_id", "layer_id", "client_order_id", "pack_id", "msg"];

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

/// One JSONL file under the run directory.
#[derive(Debug)]
struct Sink(Mutex<BufWriter<File>>);

impl Sink {
    fn create(path: PathBuf) -> Option<Self> {
        File::create(&path)
            .map(|f| Sink(Mutex::new(BufWriter::new(f))))
            .map_err(|err| eprintln!("[log] cannot open {}: {}", path.display(), err))
            .ok()
    }

    fn append(&self, line: &str) {
        if let Ok(mut w) = self.0.lock() {
            let _ = writeln!(w, "{}", line).and_then(|_| w.flush());
        }
    }
}

#[derive(Debug)]
struct RunContext {
    process_run_id: String,
    events: Option<Sink>,
    trace: Option<Sink>,
}

impl RunContext {
    fn global() -> &'static RunContext {
        RUN_CONTEXT.get_or_init(RunContext::init)
    }

    fn stdout_only(process_run_id: String) -> Self {
        RunContext { process_run_id, events: None, trace: None }
    }

    /// `LOG_DIR/<run id>/` holds `manifest.json`, `events.jsonl` and `trace.jsonl`.
    fn init() -> Self {
        let process_run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("p-{}-{}", ts_epoch_ms(), process::id()));
        if std::env::var_os("LOG_STDOUT_ONLY").is_some() {
            return Self::stdout_only(process_run_id);
        }

        let run_dir = PathBuf::from(std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".into()))
            .join(&process_run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] cannot create {}: {}", run_dir.display(), err);
            return Self::stdout_only(process_run_id);
        }
        let manifest = json!({
            "run_id": process_run_id,
            "ts": ts_now(),
            "pid": process::id(),
            "log_dir": run_dir.to_string_lossy(),
        });
        let _ = std::fs::write(run_dir.join("manifest.json"), manifest.to_string());

        RunContext {
            events: Sink::create(run_dir.join("events.jsonl")),
            trace: Sink::create(run_dir.join("trace.jsonl")),
            process_run_id,
        }
    }

    fn sink_for(&self, level: Level) -> Option<&Sink> {
        if level <= Level::Debug {
            self.trace.as_ref()
        } else {
            self.events.as_ref()
        }
    }
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    for key in REDACTED_KEYS {
        if let Some(v) = fields.get_mut(*key) {
            *v = Value::String("[REDACTED]".into());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let top = PROMOTED_KEYS
        .iter()
        .filter_map(|key| fields.remove(*key).map(|v| (key.to_string(), v)))
        .collect();
    (top, fields)
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

/// Emit one structured line if `level` and `domain` pass the env filters.
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::threshold() || !domain.is_enabled() {
        return;
    }
    let ctx = RunContext::global();
    let (mut top, data) = split_fields(sanitize_fields(fields));

    let mut entry = Map::new();
    entry.insert("ts".into(), json!(ts_now()));
    entry.insert("process_run_id".into(), json!(ctx.process_run_id));
    entry.insert("seq".into(), json!(next_seq()));
    entry.insert("lvl".into(), json!(level.as_str().to_uppercase()));
    entry.insert("component".into(), json!(domain.as_str()));
    entry.insert("event".into(), json!(event));
    entry.insert("msg".into(), top.remove("msg").unwrap_or_else(|| json!("")));
    entry.extend(top);
    entry.insert("data".into(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if let Some(sink) = ctx.sink_for(level) {
        sink.append(&line);
    }
    println!("{}", line);
}

// =============================================================================
// Domain-specific helpers
// =============================================================================

pub fn log_profile_selected(layer_id: &str, run_reason: &str, model_id: &str, priority: u32, candidates: usize) {
    log(
        Level::Info,
        Domain::Orchestrator,
        "profile_selected",
        obj(&[
            ("layer_id", v_str(layer_id)),
            ("run_reason", v_str(run_reason)),
            ("model_id", v_str(model_id)),
            ("priority", json!(priority)),
            ("candidates", json!(candidates)),
        ]),
    );
}

pub fn log_layer_run(run_id: &str, layer_id: &str, pack_id: &str, determinism_hash: &str, elapsed_ms: f64) {
    log(
        Level::Info,
        Domain::Orchestrator,
        "layer_run",
        obj(&[
            ("run_id", v_str(run_id)),
            ("layer_id", v_str(layer_id)),
            ("pack_id", v_str(pack_id)),
            ("determinism_hash", v_str(determinism_hash)),
            ("elapsed_ms", v_num(elapsed_ms)),
        ]),
    );
}

/// Every fatal run error goes through here so operators can see why a run halted.
pub fn log_run_error(run_id: &str, layer_id: &str, reason_code: &str, detail: &str) {
    log(
        Level::Error,
        Domain::Audit,
        "run_error",
        obj(&[
            ("run_id", v_str(run_id)),
            ("layer_id", v_str(layer_id)),
            ("reason_code", v_str(reason_code)),
            ("detail", v_str(detail)),
        ]),
    );
}

pub fn log_gate_decision(gate_id: &str, status: &str, reasons: &[String], inputs_digest: &str) {
    let level = if reasons.is_empty() { Level::Info } else { Level::Warn };
    log(
        level,
        Domain::Risk,
        "gate_decision",
        obj(&[
            ("gate_id", v_str(gate_id)),
            ("status", v_str(status)),
            ("reasons", Value::Array(reasons.iter().map(|r| v_str(r)).collect())),
            ("inputs_snapshot_digest", v_str(inputs_digest)),
        ]),
    );
}

pub fn log_risk_check(check: &str, result: &str, value: f64, threshold: f64) {
    log(
        Level::Debug,
        Domain::Risk,
        "guard",
        obj(&[
            ("check", v_str(check)),
            ("result", v_str(result)),
            ("value", v_num(value)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

pub fn log_order_transition(client_order_id: &str, prev: &str, next: &str, revision: u64, source: &str) {
    log(
        Level::Info,
        Domain::Exec,
        "order_state",
        obj(&[
            ("client_order_id", v_str(client_order_id)),
            ("prev_state", v_str(prev)),
            ("new_state", v_str(next)),
            ("revision", json!(revision)),
            ("source", v_str(source)),
        ]),
    );
}

pub fn log_escalation(client_order_id: &str, reason: &str) {
    log(
        Level::Error,
        Domain::Reconcile,
        "operator_escalation",
        obj(&[("client_order_id", v_str(client_order_id)), ("reason", v_str(reason))]),
    );
}

pub fn log_kill_switch(event: &str, reason: Option<&str>) {
    log(
        Level::Warn,
        Domain::KillSwitch,
        event,
        obj(&[("reason", reason.map(v_str).unwrap_or(Value::Null))]),
    );
}

pub fn log_audit(event_type: &str, subject: &str, input_hash: &str, output_hash: &str) {
    log(
        Level::Info,
        Domain::Audit,
        event_type,
        obj(&[
            ("subject", v_str(subject)),
            ("input_hash", v_str(input_hash)),
            ("output_hash", v_str(output_hash)),
        ]),
    );
}

// =============================================================================
// Utility Functions
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
