//! Structured logging for the decision pipeline.
//!
//! Design goals:
//! 1. Multi-level granularity (TRACE → FATAL)
//! 2. Domain-specific categories for filtering
//! 3. Replay/audit support via deterministic sequence numbers
//! 4. Payload text never logged in full — redacted to a short preview

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
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Guardrail,  // Check results, verdict aggregation
    Experiment, // Assignments, significance evaluations, weight moves
    Ledger,     // Audit appends, corrections
    Pipeline,   // Decide lifecycle, idempotent replays
    System,     // Startup, recovery, persistence
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Guardrail => "guardrail",
            Domain::Experiment => "experiment",
            Domain::Ledger => "ledger",
            Domain::Pipeline => "pipeline",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context and sequence counter
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }
        let events_path = run_dir.join("events.jsonl");
        let trace_path = run_dir.join("trace.jsonl");
        let manifest_path = run_dir.join("manifest.json");

        let _ = std::fs::write(
            manifest_path,
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        let events = File::create(events_path).unwrap_or_else(|err| {
            eprintln!("[log] failed to create events log: {}", err);
            File::create("/tmp/campaignfx-events.jsonl").expect("events fallback")
        });
        let trace = File::create(trace_path).unwrap_or_else(|err| {
            eprintln!("[log] failed to create trace log: {}", err);
            File::create("/tmp/campaignfx-trace.jsonl").expect("trace fallback")
        });

        RunContext {
            run_id,
            events: Mutex::new(BufWriter::new(events)),
            trace: Mutex::new(BufWriter::new(trace)),
        }
    })
}

/// Payload text is customer-facing content; logs carry a preview only.
pub fn preview(text: &str) -> String {
    let mut t = text.replace('\n', " ");
    if t.chars().count() > 80 {
        t = t.chars().take(80).collect();
        t.push('…');
    }
    t
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    for key in ["body_text", "subject_line"] {
        if let Some(Value::String(s)) = fields.get(key) {
            let p = preview(s);
            fields.insert(key.to_string(), Value::String(p));
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["action_id", "subject_id", "experiment_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(domain.as_str()));
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
    println!("{}", line);
}

// =============================================================================
// Domain-specific logging helpers
// =============================================================================

pub fn log_check(action_id: &str, check: &str, verdict: &str, reason: &str) {
    log(
        Level::Debug,
        Domain::Guardrail,
        "check",
        obj(&[
            ("action_id", v_str(action_id)),
            ("check", v_str(check)),
            ("verdict", v_str(verdict)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_verdict(action_id: &str, subject_id: &str, verdict: &str, failed: usize) {
    log(
        Level::Info,
        Domain::Guardrail,
        "verdict",
        obj(&[
            ("action_id", v_str(action_id)),
            ("subject_id", v_str(subject_id)),
            ("verdict", v_str(verdict)),
            ("failed_checks", json!(failed)),
        ]),
    );
}

pub fn log_assignment(experiment_id: &str, subject_id: &str, variant_id: &str, sticky: bool) {
    log(
        Level::Debug,
        Domain::Experiment,
        "assignment",
        obj(&[
            ("experiment_id", v_str(experiment_id)),
            ("subject_id", v_str(subject_id)),
            ("variant_id", v_str(variant_id)),
            ("sticky", json!(sticky)),
        ]),
    );
}

pub fn log_evaluation(experiment_id: &str, decision: &str, detail: &str) {
    log(
        Level::Info,
        Domain::Experiment,
        "evaluation",
        obj(&[
            ("experiment_id", v_str(experiment_id)),
            ("decision", v_str(decision)),
            ("msg", v_str(detail)),
        ]),
    );
}

pub fn log_append(action_id: &str, seq: u64, verdict: &str) {
    log(
        Level::Info,
        Domain::Ledger,
        "append",
        obj(&[
            ("action_id", v_str(action_id)),
            ("audit_seq", json!(seq)),
            ("verdict", v_str(verdict)),
        ]),
    );
}

pub fn log_override(original_seq: u64, new_seq: u64, approve: bool, reason: &str) {
    log(
        Level::Warn,
        Domain::Ledger,
        "override",
        obj(&[
            ("original_seq", json!(original_seq)),
            ("correction_seq", json!(new_seq)),
            ("approve", json!(approve)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_replay(action_id: &str, seq: u64) {
    log(
        Level::Debug,
        Domain::Pipeline,
        "idempotent_replay",
        obj(&[("action_id", v_str(action_id)), ("audit_seq", json!(seq))]),
    );
}

// =============================================================================
// Aggregated counters for periodic summaries
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<Aggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<Aggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(Aggregator::default()))
}

#[derive(Default)]
struct Aggregator {
    decisions: u64,
    rejections: u64,
    escalations: u64,
    overrides: u64,
}

/// Increment a counter in the aggregator
pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        match event {
            "decision" => agg.decisions += 1,
            "rejection" => agg.rejections += 1,
            "escalation" => agg.escalations += 1,
            "override" => agg.overrides += 1,
            _ => {}
        }
    }
}

/// Emit and reset aggregated stats; called on the persistence tick.
pub fn flush_aggregator() {
    if let Ok(mut agg) = get_aggregator().lock() {
        log(
            Level::Info,
            Domain::System,
            "aggregated_stats",
            obj(&[
                ("decisions", json!(agg.decisions)),
                ("rejections", json!(agg.rejections)),
                ("escalations", json!(agg.escalations)),
                ("overrides", json!(agg.overrides)),
            ]),
        );
        *agg = Aggregator::default();
    }
}

// =============================================================================
// Utility functions
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(200);
        let p = preview(&long);
        assert!(p.len() < 90);
        assert!(p.ends_with('…'));
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn test_sanitize_redacts_body() {
        let fields = obj(&[("body_text", v_str(&"y".repeat(200)))]);
        let clean = sanitize_fields(fields);
        let body = clean.get("body_text").unwrap().as_str().unwrap();
        assert!(body.len() < 90);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
