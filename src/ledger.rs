//! Append-only audit ledger.
//!
//! One record per completed pipeline invocation. Append is the only
//! mutator: sequence numbers strictly increase and are never reused, and
//! the write is durable before the sequence is handed back — a caller that
//! saw a seq can rely on the decision surviving a crash. There is no API
//! to edit or delete; corrections are new records referencing the original.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::action::{ActionKind, Channel, ProposedAction};
use crate::error::DecisionError;
use crate::guardrail::{GuardrailResult, Verdict};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Assigned by the ledger at append; 0 until then.
    pub seq: u64,
    pub action_id: String,
    pub subject_id: String,
    pub kind: ActionKind,
    pub channel: Channel,
    pub experiment_id: Option<String>,
    pub variant_id: Option<String>,
    pub results: Vec<GuardrailResult>,
    pub verdict: Verdict,
    pub human_override: bool,
    pub override_reason: Option<String>,
    /// Sequence of the record this one corrects, for override records.
    pub corrects: Option<u64>,
    pub created_ts: u64,
}

impl AuditRecord {
    /// Record for a freshly decided action.
    pub fn for_decision(
        action: &ProposedAction,
        results: Vec<GuardrailResult>,
        verdict: Verdict,
        variant_id: Option<String>,
        created_ts: u64,
    ) -> Self {
        Self {
            seq: 0,
            action_id: action.id.clone(),
            subject_id: action.subject_id.clone(),
            kind: action.kind,
            channel: action.channel,
            experiment_id: action.experiment_id.clone(),
            variant_id,
            results,
            verdict,
            human_override: false,
            override_reason: None,
            corrects: None,
            created_ts,
        }
    }

    /// Correction record for a human override of `original`. The original
    /// stays untouched; readers follow `corrects` to reconstruct history.
    pub fn correction(original: &AuditRecord, approve: bool, reason: &str, created_ts: u64) -> Self {
        Self {
            seq: 0,
            action_id: original.action_id.clone(),
            subject_id: original.subject_id.clone(),
            kind: original.kind,
            channel: original.channel,
            experiment_id: original.experiment_id.clone(),
            variant_id: original.variant_id.clone(),
            results: original.results.clone(),
            verdict: if approve { Verdict::Approved } else { Verdict::Rejected },
            human_override: true,
            override_reason: Some(reason.to_string()),
            corrects: Some(original.seq),
            created_ts,
        }
    }
}

/// Read-side filter. Empty filter returns everything in seq order.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub subject_id: Option<String>,
    pub experiment_id: Option<String>,
    pub since_ts: Option<u64>,
    pub until_ts: Option<u64>,
    pub limit: Option<usize>,
}

pub trait AuditLedger: Send + Sync {
    /// Durable append. Returns the assigned sequence number.
    fn append(&self, record: AuditRecord) -> Result<u64, DecisionError>;

    /// Read-only traversal in sequence order.
    fn read(&self, filter: &RecordFilter) -> Result<Vec<AuditRecord>, DecisionError>;

    fn get(&self, seq: u64) -> Result<Option<AuditRecord>, DecisionError>;

    /// The original (non-correction) decision record for an action id.
    fn find_action(&self, action_id: &str) -> Result<Option<AuditRecord>, DecisionError>;
}

// =============================================================================
// Sqlite-backed ledger
// =============================================================================

pub struct SqliteLedger {
    conn: Mutex<Connection>,
    last_seq: Mutex<u64>,
}

impl SqliteLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecisionError> {
        let conn = Connection::open(path)?;
        // Durable-before-acknowledge: the fsync must land before append
        // returns a sequence number.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                action_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                channel TEXT NOT NULL,
                experiment_id TEXT,
                variant_id TEXT,
                results TEXT NOT NULL,
                verdict TEXT NOT NULL,
                human_override INTEGER NOT NULL,
                override_reason TEXT,
                corrects INTEGER,
                created_ts INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_action
                ON audit(action_id) WHERE corrects IS NULL;
            CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit(subject_id);
            CREATE INDEX IF NOT EXISTS idx_audit_experiment ON audit(experiment_id);",
        )?;

        let last_seq: i64 =
            conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM audit", [], |row| row.get(0))?;
        Ok(Self { conn: Mutex::new(conn), last_seq: Mutex::new(last_seq as u64) })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
        let kind: String = row.get(3)?;
        let channel: String = row.get(4)?;
        let results: String = row.get(7)?;
        let verdict: String = row.get(8)?;
        Ok(AuditRecord {
            seq: row.get::<_, i64>(0)? as u64,
            action_id: row.get(1)?,
            subject_id: row.get(2)?,
            kind: ActionKind::parse(&kind).unwrap_or(ActionKind::SendMessage),
            channel: Channel::parse(&channel).unwrap_or(Channel::Email),
            experiment_id: row.get(5)?,
            variant_id: row.get(6)?,
            results: serde_json::from_str(&results).unwrap_or_default(),
            // Unknown verdict text reads as rejected: corrupt rows fail closed.
            verdict: Verdict::parse(&verdict).unwrap_or(Verdict::Rejected),
            human_override: row.get::<_, i64>(9)? != 0,
            override_reason: row.get(10)?,
            corrects: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
            created_ts: row.get::<_, i64>(12)? as u64,
        })
    }
}

const SELECT_COLS: &str = "seq, action_id, subject_id, kind, channel, experiment_id, variant_id, \
                           results, verdict, human_override, override_reason, corrects, created_ts";

impl AuditLedger for SqliteLedger {
    fn append(&self, record: AuditRecord) -> Result<u64, DecisionError> {
        let conn = self.conn.lock().unwrap();
        let results = serde_json::to_string(&record.results)
            .map_err(|e| DecisionError::Transient(format!("serialize results: {}", e)))?;
        let inserted = conn.execute(
            "INSERT INTO audit (action_id, subject_id, kind, channel, experiment_id, variant_id,
                                results, verdict, human_override, override_reason, corrects, created_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.action_id,
                record.subject_id,
                record.kind.as_str(),
                record.channel.as_str(),
                record.experiment_id,
                record.variant_id,
                results,
                record.verdict.as_str(),
                record.human_override as i64,
                record.override_reason,
                record.corrects.map(|v| v as i64),
                record.created_ts as i64,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, msg))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(DecisionError::Transient(format!(
                    "decision already recorded for action {}: {}",
                    record.action_id,
                    msg.unwrap_or_default()
                )));
            }
            Err(e) => return Err(e.into()),
        }
        let seq = conn.last_insert_rowid() as u64;
        // Monotonicity check happens under the connection lock so a pair of
        // concurrent appends cannot observe each other's seq out of order.
        let mut last = self.last_seq.lock().unwrap();
        if seq <= *last {
            return Err(DecisionError::Invariant(format!(
                "audit sequence went backwards: {} after {}",
                seq, *last
            )));
        }
        *last = seq;
        Ok(seq)
    }

    fn read(&self, filter: &RecordFilter) -> Result<Vec<AuditRecord>, DecisionError> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("SELECT {} FROM audit WHERE 1=1", SELECT_COLS);
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(subject) = &filter.subject_id {
            sql.push_str(" AND subject_id = ?");
            args.push(Box::new(subject.clone()));
        }
        if let Some(experiment) = &filter.experiment_id {
            sql.push_str(" AND experiment_id = ?");
            args.push(Box::new(experiment.clone()));
        }
        if let Some(since) = filter.since_ts {
            sql.push_str(" AND created_ts >= ?");
            args.push(Box::new(since as i64));
        }
        if let Some(until) = filter.until_ts {
            sql.push_str(" AND created_ts <= ?");
            args.push(Box::new(until as i64));
        }
        sql.push_str(" ORDER BY seq");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Self::row_to_record(row)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn get(&self, seq: u64) -> Result<Option<AuditRecord>, DecisionError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM audit WHERE seq = ?1", SELECT_COLS);
        let found = conn
            .query_row(&sql, params![seq as i64], |row| Self::row_to_record(row))
            .optional()?;
        Ok(found)
    }

    fn find_action(&self, action_id: &str) -> Result<Option<AuditRecord>, DecisionError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM audit WHERE action_id = ?1 AND corrects IS NULL ORDER BY seq LIMIT 1",
            SELECT_COLS
        );
        let found = conn
            .query_row(&sql, params![action_id], |row| Self::row_to_record(row))
            .optional()?;
        Ok(found)
    }
}

// =============================================================================
// In-memory ledger (deterministic tests, no real store)
// =============================================================================

#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<AuditRecord>>,
    by_action: Mutex<HashMap<String, u64>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLedger for MemoryLedger {
    fn append(&self, mut record: AuditRecord) -> Result<u64, DecisionError> {
        let mut records = self.records.lock().unwrap();
        let mut by_action = self.by_action.lock().unwrap();
        if record.corrects.is_none() && by_action.contains_key(&record.action_id) {
            return Err(DecisionError::Transient(format!(
                "decision already recorded for action {}",
                record.action_id
            )));
        }
        let seq = records.last().map(|r| r.seq).unwrap_or(0) + 1;
        record.seq = seq;
        if record.corrects.is_none() {
            by_action.insert(record.action_id.clone(), seq);
        }
        records.push(record);
        Ok(seq)
    }

    fn read(&self, filter: &RecordFilter) -> Result<Vec<AuditRecord>, DecisionError> {
        let records = self.records.lock().unwrap();
        let mut out: Vec<AuditRecord> = records
            .iter()
            .filter(|r| filter.subject_id.as_ref().map_or(true, |s| &r.subject_id == s))
            .filter(|r| {
                filter.experiment_id.as_ref().map_or(true, |e| r.experiment_id.as_ref() == Some(e))
            })
            .filter(|r| filter.since_ts.map_or(true, |ts| r.created_ts >= ts))
            .filter(|r| filter.until_ts.map_or(true, |ts| r.created_ts <= ts))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn get(&self, seq: u64) -> Result<Option<AuditRecord>, DecisionError> {
        let records = self.records.lock().unwrap();
        Ok(records.iter().find(|r| r.seq == seq).cloned())
    }

    fn find_action(&self, action_id: &str) -> Result<Option<AuditRecord>, DecisionError> {
        let by_action = self.by_action.lock().unwrap();
        let seq = match by_action.get(action_id) {
            Some(seq) => *seq,
            None => return Ok(None),
        };
        drop(by_action);
        self.get(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Payload;

    fn sample_action(id: &str, subject: &str) -> ProposedAction {
        ProposedAction {
            id: id.to_string(),
            subject_id: subject.to_string(),
            kind: ActionKind::SendMessage,
            channel: Channel::Email,
            payload: Payload::default(),
            requested_ts: 1_000,
            experiment_id: Some("exp-1".to_string()),
        }
    }

    fn sample_record(id: &str, subject: &str, ts: u64) -> AuditRecord {
        let action = sample_action(id, subject);
        AuditRecord::for_decision(
            &action,
            vec![GuardrailResult::pass("compliance", "consent fresh")],
            Verdict::Approved,
            Some("control".to_string()),
            ts,
        )
    }

    fn ledgers() -> Vec<(&'static str, Box<dyn AuditLedger>, Option<tempfile::TempDir>)> {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = SqliteLedger::open(dir.path().join("audit.sqlite")).unwrap();
        vec![
            ("memory", Box::new(MemoryLedger::new()) as Box<dyn AuditLedger>, None),
            ("sqlite", Box::new(sqlite), Some(dir)),
        ]
    }

    #[test]
    fn test_append_is_monotonic() {
        for (name, ledger, _guard) in ledgers() {
            let s1 = ledger.append(sample_record("a-1", "s-1", 10)).unwrap();
            let s2 = ledger.append(sample_record("a-2", "s-1", 20)).unwrap();
            let s3 = ledger.append(sample_record("a-3", "s-2", 30)).unwrap();
            assert!(s1 < s2 && s2 < s3, "{}: sequence not increasing", name);
        }
    }

    #[test]
    fn test_duplicate_action_id_rejected() {
        for (name, ledger, _guard) in ledgers() {
            ledger.append(sample_record("a-1", "s-1", 10)).unwrap();
            let err = ledger.append(sample_record("a-1", "s-1", 11)).unwrap_err();
            assert!(err.is_retryable(), "{}: duplicate should map to transient", name);
        }
    }

    #[test]
    fn test_read_filters() {
        for (name, ledger, _guard) in ledgers() {
            ledger.append(sample_record("a-1", "s-1", 10)).unwrap();
            ledger.append(sample_record("a-2", "s-2", 20)).unwrap();
            ledger.append(sample_record("a-3", "s-1", 30)).unwrap();

            let by_subject = ledger
                .read(&RecordFilter { subject_id: Some("s-1".to_string()), ..Default::default() })
                .unwrap();
            assert_eq!(by_subject.len(), 2, "{}", name);

            let by_time = ledger
                .read(&RecordFilter { since_ts: Some(15), until_ts: Some(25), ..Default::default() })
                .unwrap();
            assert_eq!(by_time.len(), 1, "{}", name);
            assert_eq!(by_time[0].action_id, "a-2");

            let by_experiment = ledger
                .read(&RecordFilter {
                    experiment_id: Some("exp-1".to_string()),
                    limit: Some(2),
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(by_experiment.len(), 2, "{}", name);
        }
    }

    #[test]
    fn test_correction_leaves_original_untouched() {
        for (name, ledger, _guard) in ledgers() {
            let mut rejected = sample_record("a-1", "s-1", 10);
            rejected.verdict = Verdict::Rejected;
            rejected.variant_id = None;
            let seq = ledger.append(rejected).unwrap();

            let original = ledger.get(seq).unwrap().unwrap();
            let correction = AuditRecord::correction(&original, true, "reviewed by ops", 20);
            let correction_seq = ledger.append(correction).unwrap();
            assert!(correction_seq > seq, "{}", name);

            let still_there = ledger.get(seq).unwrap().unwrap();
            assert_eq!(still_there.verdict, Verdict::Rejected, "{}", name);
            assert!(!still_there.human_override, "{}", name);

            let corrected = ledger.get(correction_seq).unwrap().unwrap();
            assert_eq!(corrected.verdict, Verdict::Approved);
            assert!(corrected.human_override);
            assert_eq!(corrected.corrects, Some(seq));
            assert_eq!(corrected.override_reason.as_deref(), Some("reviewed by ops"));

            // find_action still resolves to the original decision.
            let found = ledger.find_action("a-1").unwrap().unwrap();
            assert_eq!(found.seq, seq, "{}", name);
        }
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.sqlite");

        let seq;
        {
            let ledger = SqliteLedger::open(&path).unwrap();
            seq = ledger.append(sample_record("a-1", "s-1", 10)).unwrap();
        }

        let ledger = SqliteLedger::open(&path).unwrap();
        let record = ledger.get(seq).unwrap().unwrap();
        assert_eq!(record.action_id, "a-1");
        assert_eq!(record.verdict, Verdict::Approved);
        assert_eq!(record.results.len(), 1);

        // Sequences continue after the old maximum, never reusing.
        let next = ledger.append(sample_record("a-2", "s-1", 20)).unwrap();
        assert!(next > seq);
    }

    #[test]
    fn test_concurrent_appends_unique_seqs() {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(SqliteLedger::open(dir.path().join("audit.sqlite")).unwrap());
        let mut handles = Vec::new();
        for t in 0..8 {
            let ledger = ledger.clone();
            handles.push(thread::spawn(move || {
                let mut seqs = Vec::new();
                for i in 0..25 {
                    let id = format!("a-{}-{}", t, i);
                    seqs.push(ledger.append(sample_record(&id, "s-1", 10)).unwrap());
                }
                seqs
            }));
        }
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "sequence numbers collided");
    }
}
