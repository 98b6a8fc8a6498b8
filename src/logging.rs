//! Structured logging for the coherence runtime.
//!
//! Design goals:
//! 1. Multi-level granularity (TRACE → FATAL)
//! 2. Component domains for filtering
//! 3. Summarization-friendly periodic checkpoints
//! 4. Replay/audit support via sequence numbers and snapshot hashes

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

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
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Bus,         // Publish/subscribe delivery
    Field,       // Node upserts, restores
    Regulator,   // Closed-loop corrections
    Ledger,      // Appends, index mirror
    Repair,      // Instability, rollback
    Cycle,       // Tick orchestration
    Telemetry,   // Indexed records, replay
    Bridge,      // Peer gossip
    Stream,      // WebSocket fan-out
    Convergence, // Target re-tuning
    System,      // Startup, shutdown
    Profile,     // Performance profiling
    Audit,       // Replay/audit trail entries
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Bus => "bus",
            Domain::Field => "field",
            Domain::Regulator => "regulator",
            Domain::Ledger => "ledger",
            Domain::Repair => "repair",
            Domain::Cycle => "cycle",
            Domain::Telemetry => "telemetry",
            Domain::Bridge => "bridge",
            Domain::Stream => "stream",
            Domain::Convergence => "convergence",
            Domain::System => "system",
            Domain::Profile => "profile",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS is a comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Sequence counter for ordering
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
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
    metrics: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
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
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let stdout = !matches!(std::env::var("LOG_STDOUT").as_deref(), Ok("0") | Ok("false"));
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
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
            run_id,
            stdout,
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            metrics: open_sink(run_dir.join("metrics.jsonl")),
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "sync_token", "signature"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["session_id", "entry_id", "node_id", "peer", "msg"] {
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

/// Epoch milliseconds (for replay correlation)
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
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
    if event.starts_with("metrics.") || event == "aggregated_stats" {
        write_line(&ctx.metrics, &line);
    }
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.stdout {
        println!("{}", line);
    }
}

// =============================================================================
// Runtime helpers
// =============================================================================

/// One line per tick; carries the outcome and the primary ledger entry.
pub fn log_tick(
    session_id: &str,
    tick: u64,
    outcome: &str,
    entry_id: &str,
    coherence: f64,
    phi: f64,
) {
    agg_increment("tick");
    log(
        Level::Info,
        Domain::Cycle,
        "tick",
        obj(&[
            ("session_id", v_str(session_id)),
            ("entry_id", v_str(entry_id)),
            ("tick", json!(tick)),
            ("outcome", v_str(outcome)),
            ("coherence", v_num(coherence)),
            ("phi", v_num(phi)),
        ]),
    );
}

pub fn log_commit(entry_id: &str, status: &str, kind: &str, c_total: f64, coherence: f64) {
    if status == "committed" {
        agg_increment("commit");
    }
    log(
        Level::Debug,
        Domain::Ledger,
        "append",
        obj(&[
            ("entry_id", v_str(entry_id)),
            ("status", v_str(status)),
            ("kind", v_str(kind)),
            ("c_total", v_num(c_total)),
            ("coherence", v_num(coherence)),
        ]),
    );
}

pub fn log_rollback(entry_id: &str, rollback_of: &str, reasons: &[String], nodes: usize) {
    agg_increment("rollback");
    log(
        Level::Warn,
        Domain::Repair,
        "rollback",
        obj(&[
            ("entry_id", v_str(entry_id)),
            ("rollback_of", v_str(rollback_of)),
            (
                "reasons",
                Value::Array(reasons.iter().map(|r| v_str(r)).collect()),
            ),
            ("nodes", json!(nodes)),
        ]),
    );
}

pub fn log_regulation(status: &str, smoothed: f64, deviation: f64, corrective: f64, target: f64) {
    log(
        Level::Debug,
        Domain::Regulator,
        "regulate",
        obj(&[
            ("status", v_str(status)),
            ("smoothed", v_num(smoothed)),
            ("deviation", v_num(deviation)),
            ("corrective", v_num(corrective)),
            ("target", v_num(target)),
        ]),
    );
}

pub fn log_peer_sync(peer: &str, status: &str, coherence: Option<f64>, target: Option<f64>) {
    if status != "synced" {
        agg_increment("peer_failure");
    }
    let level = if status == "synced" { Level::Info } else { Level::Warn };
    log(
        level,
        Domain::Bridge,
        "peer_sync",
        obj(&[
            ("peer", v_str(peer)),
            ("status", v_str(status)),
            ("coherence", coherence.map(v_num).unwrap_or(Value::Null)),
            ("target", target.map(v_num).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_subscriber_drop(subscriber: u64, reason: &str) {
    agg_increment("subscriber_drop");
    log(
        Level::Warn,
        Domain::Stream,
        "subscriber_dropped",
        obj(&[("subscriber", json!(subscriber)), ("reason", v_str(reason))]),
    );
}

/// Audit entry pairing a ledger record with the digest of the state it captured.
pub fn log_audit(event_type: &str, entry_id: &str, state_hash: &str) {
    log(
        Level::Info,
        Domain::Audit,
        event_type,
        obj(&[("entry_id", v_str(entry_id)), ("state_hash", v_str(state_hash))]),
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

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            context: None,
            started: Instant::now(),
            enabled: Self::should_sample(),
        }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Log Aggregator for Periodic Summaries
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct AggregateCounts {
    ticks: u64,
    commits: u64,
    rollbacks: u64,
    subscriber_drops: u64,
    peer_failures: u64,
}

struct LogAggregator {
    counts: AggregateCounts,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            counts: AggregateCounts::default(),
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    fn increment(&mut self, event: &str) {
        match event {
            "tick" => self.counts.ticks += 1,
            "commit" => self.counts.commits += 1,
            "rollback" => self.counts.rollbacks += 1,
            "subscriber_drop" => self.counts.subscriber_drops += 1,
            "peer_failure" => self.counts.peer_failures += 1,
            _ => {}
        }
    }

    fn maybe_flush(&mut self) -> Option<AggregateCounts> {
        if self.last_flush.elapsed().as_secs() >= self.flush_interval_secs {
            let result = self.counts;
            self.counts = AggregateCounts::default();
            self.last_flush = Instant::now();
            Some(result)
        } else {
            None
        }
    }
}

/// Call periodically to emit aggregated stats
pub fn tick_aggregator() {
    if let Ok(mut agg) = get_aggregator().lock() {
        if let Some(c) = agg.maybe_flush() {
            log(
                Level::Info,
                Domain::System,
                "aggregated_stats",
                obj(&[
                    ("ticks", json!(c.ticks)),
                    ("commits", json!(c.commits)),
                    ("rollbacks", json!(c.rollbacks)),
                    ("subscriber_drops", json!(c.subscriber_drops)),
                    ("peer_failures", json!(c.peer_failures)),
                ]),
            );
        }
    }
}

/// Increment a counter in the aggregator
pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(event);
    }
}

// =============================================================================
// Tests
// =============================================================================
