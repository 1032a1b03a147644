//! Experiment allocation and statistical promotion.
//!
//! Two independent contracts:
//! - `assign`: deterministic, sticky variant assignment. A subject maps to
//!   the same variant for the lifetime of an experiment; first contact
//!   hashes (experiment_id, subject_id) onto the unit interval and walks
//!   cumulative weights.
//! - `evaluate`: significance analysis over accumulated counters, producing
//!   a promote / retire / close decision. Evaluation never mutates; `apply`
//!   executes the weight moves and must leave weights summing to 1.
//!
//! Counters, weights, and assignments write through to sqlite when a store
//! is attached, so allocation state survives restarts.

pub mod stats;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::DecisionError;
use crate::logging;

const WEIGHT_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Collecting,
    Significant,
    Closed,
}

impl ExperimentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentState::Collecting => "collecting",
            ExperimentState::Significant => "significant",
            ExperimentState::Closed => "closed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "significant" => ExperimentState::Significant,
            "closed" => ExperimentState::Closed,
            _ => ExperimentState::Collecting,
        }
    }
}

/// One arm of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub weight: f64,
    pub impressions: u64,
    pub conversions: u64,
}

impl Variant {
    pub fn new(id: &str, weight: f64) -> Self {
        Self { id: id.to_string(), weight, impressions: 0, conversions: 0 }
    }

    pub fn conversion_rate(&self) -> f64 {
        if self.impressions == 0 {
            return 0.0;
        }
        self.conversions as f64 / self.impressions as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub control_id: String,
    /// Registration order is load-bearing: cumulative-weight hashing walks
    /// this vec, so the order must be stable across restarts.
    pub variants: Vec<Variant>,
    pub state: ExperimentState,
    pub created_ts: u64,
    #[serde(skip)]
    assignments: HashMap<String, String>,
}

impl Experiment {
    pub fn new(
        id: &str,
        control_id: &str,
        variants: Vec<Variant>,
        created_ts: u64,
    ) -> Result<Self, DecisionError> {
        if variants.len() < 2 {
            return Err(DecisionError::Invariant(format!(
                "experiment {} needs at least 2 variants",
                id
            )));
        }
        if !variants.iter().any(|v| v.id == control_id) {
            return Err(DecisionError::Invariant(format!(
                "experiment {} control {} not among variants",
                id, control_id
            )));
        }
        let exp = Self {
            id: id.to_string(),
            control_id: control_id.to_string(),
            variants,
            state: ExperimentState::Collecting,
            created_ts,
            assignments: HashMap::new(),
        };
        exp.validate_weights()?;
        Ok(exp)
    }

    pub fn variant(&self, id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    fn variant_mut(&mut self, id: &str) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id == id)
    }

    pub fn assignment(&self, subject_id: &str) -> Option<&str> {
        self.assignments.get(subject_id).map(|s| s.as_str())
    }

    fn validate_weights(&self) -> Result<(), DecisionError> {
        let sum: f64 = self.variants.iter().map(|v| v.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_EPS {
            return Err(DecisionError::Invariant(format!(
                "experiment {} weights sum to {:.6}, expected 1",
                self.id, sum
            )));
        }
        if self.variants.iter().any(|v| v.weight < -WEIGHT_EPS || v.weight > 1.0 + WEIGHT_EPS) {
            return Err(DecisionError::Invariant(format!(
                "experiment {} has a weight outside 0..1",
                self.id
            )));
        }
        Ok(())
    }

    /// Variant picked by walking cumulative weights at `point` in [0,1).
    fn variant_at(&self, point: f64) -> &Variant {
        let mut cumulative = 0.0;
        for v in &self.variants {
            cumulative += v.weight;
            if point < cumulative {
                return v;
            }
        }
        // Float residue at the top of the interval lands on the last
        // non-zero-weight variant.
        self.variants
            .iter()
            .rev()
            .find(|v| v.weight > 0.0)
            .unwrap_or(&self.variants[self.variants.len() - 1])
    }
}

/// Outcome of one significance evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum EvalDecision {
    NoOp,
    Promote { variant: String, p_value: f64, lift: f64 },
    Retire { variant: String, p_value: f64 },
    Close { winner: Option<String> },
}

impl EvalDecision {
    pub fn label(&self) -> &'static str {
        match self {
            EvalDecision::NoOp => "no_op",
            EvalDecision::Promote { .. } => "promote",
            EvalDecision::Retire { .. } => "retire",
            EvalDecision::Close { .. } => "close",
        }
    }
}

/// Hash (experiment_id, subject_id) onto [0,1). Deterministic: repeated
/// assignment for a pair with unchanged weights always lands identically.
fn unit_interval(experiment_id: &str, subject_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(experiment_id.as_bytes());
    hasher.update(b"/");
    hasher.update(subject_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) as f64 / (u64::MAX as f64 + 1.0)
}

pub struct Allocator {
    cfg: Config,
    experiments: Mutex<HashMap<String, Experiment>>,
    store: Option<Mutex<Connection>>,
}

impl Allocator {
    /// Allocator without persistence, for tests and ephemeral runs.
    pub fn in_memory(cfg: Config) -> Self {
        Self { cfg, experiments: Mutex::new(HashMap::new()), store: None }
    }

    /// Allocator backed by sqlite; reloads all experiment state on open.
    pub fn open<P: AsRef<Path>>(cfg: Config, path: P) -> Result<Self, DecisionError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS experiments (
                id TEXT PRIMARY KEY,
                control_id TEXT NOT NULL,
                state TEXT NOT NULL,
                created_ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS variants (
                experiment_id TEXT NOT NULL,
                id TEXT NOT NULL,
                position INTEGER NOT NULL,
                weight REAL NOT NULL,
                impressions INTEGER NOT NULL,
                conversions INTEGER NOT NULL,
                PRIMARY KEY (experiment_id, id)
            );
            CREATE TABLE IF NOT EXISTS assignments (
                experiment_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                variant_id TEXT NOT NULL,
                PRIMARY KEY (experiment_id, subject_id)
            );",
        )?;

        let experiments = Self::load(&conn)?;
        Ok(Self {
            cfg,
            experiments: Mutex::new(experiments),
            store: Some(Mutex::new(conn)),
        })
    }

    fn load(conn: &Connection) -> Result<HashMap<String, Experiment>, DecisionError> {
        let mut experiments = HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT id, control_id, state, created_ts FROM experiments")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            for row in rows {
                let (id, control_id, state, created_ts) = row?;
                experiments.insert(
                    id.clone(),
                    Experiment {
                        id,
                        control_id,
                        variants: Vec::new(),
                        state: ExperimentState::parse(&state),
                        created_ts: created_ts as u64,
                        assignments: HashMap::new(),
                    },
                );
            }
        }
        {
            let mut stmt = conn.prepare(
                "SELECT experiment_id, id, weight, impressions, conversions
                 FROM variants ORDER BY experiment_id, position",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Variant {
                        id: row.get(1)?,
                        weight: row.get(2)?,
                        impressions: row.get::<_, i64>(3)? as u64,
                        conversions: row.get::<_, i64>(4)? as u64,
                    },
                ))
            })?;
            for row in rows {
                let (experiment_id, variant) = row?;
                if let Some(exp) = experiments.get_mut(&experiment_id) {
                    exp.variants.push(variant);
                }
            }
        }
        {
            let mut stmt =
                conn.prepare("SELECT experiment_id, subject_id, variant_id FROM assignments")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (experiment_id, subject_id, variant_id) = row?;
                if let Some(exp) = experiments.get_mut(&experiment_id) {
                    exp.assignments.insert(subject_id, variant_id);
                }
            }
        }
        Ok(experiments)
    }

    /// Register a new experiment. Re-registering an existing id is a no-op
    /// so callers can declare experiments unconditionally at startup.
    pub fn register(&self, experiment: Experiment) -> Result<(), DecisionError> {
        let mut exps = self.experiments.lock().unwrap();
        if exps.contains_key(&experiment.id) {
            return Ok(());
        }
        experiment.validate_weights()?;
        self.persist_experiment(&experiment)?;
        exps.insert(experiment.id.clone(), experiment);
        Ok(())
    }

    pub fn contains(&self, experiment_id: &str) -> bool {
        self.experiments.lock().unwrap().contains_key(experiment_id)
    }

    /// Snapshot of one experiment for inspection and tests.
    pub fn experiment(&self, experiment_id: &str) -> Option<Experiment> {
        self.experiments.lock().unwrap().get(experiment_id).cloned()
    }

    /// Sticky deterministic assignment. Returns `None` for an unknown
    /// experiment id (the pipeline treats that as "no experiment").
    pub fn assign(&self, experiment_id: &str, subject_id: &str) -> Option<String> {
        let mut exps = self.experiments.lock().unwrap();
        let exp = exps.get_mut(experiment_id)?;

        if let Some(existing) = exp.assignments.get(subject_id).cloned() {
            if let Some(v) = exp.variant_mut(&existing) {
                v.impressions += 1;
            }
            let _ = self.persist_counters(exp);
            logging::log_assignment(experiment_id, subject_id, &existing, true);
            return Some(existing);
        }

        let point = unit_interval(experiment_id, subject_id);
        let variant_id = exp.variant_at(point).id.clone();
        exp.assignments.insert(subject_id.to_string(), variant_id.clone());
        if let Some(v) = exp.variant_mut(&variant_id) {
            v.impressions += 1;
        }
        let _ = self.persist_counters(exp);
        let _ = self.persist_assignment(experiment_id, subject_id, &variant_id);
        logging::log_assignment(experiment_id, subject_id, &variant_id, false);
        Some(variant_id)
    }

    /// Compensate an impression recorded for a decision that never became
    /// durable, so a caller retry does not double-count exposure.
    pub fn revoke_impression(&self, experiment_id: &str, variant_id: &str) {
        let mut exps = self.experiments.lock().unwrap();
        if let Some(exp) = exps.get_mut(experiment_id) {
            if let Some(v) = exp.variant_mut(variant_id) {
                v.impressions = v.impressions.saturating_sub(1);
            }
            let _ = self.persist_counters(exp);
        }
    }

    /// Record a conversion for a previously assigned variant.
    pub fn record_outcome(
        &self,
        experiment_id: &str,
        variant_id: &str,
    ) -> Result<(), DecisionError> {
        let mut exps = self.experiments.lock().unwrap();
        let exp = exps.get_mut(experiment_id).ok_or_else(|| {
            DecisionError::Invariant(format!("outcome for unknown experiment {}", experiment_id))
        })?;
        let variant = exp.variant_mut(variant_id).ok_or_else(|| {
            DecisionError::Invariant(format!(
                "outcome for unknown variant {}/{}",
                experiment_id, variant_id
            ))
        })?;
        variant.conversions += 1;
        self.persist_counters(exp)?;
        Ok(())
    }

    /// Significance analysis over accumulated counters. Pure: re-running
    /// without new outcomes always returns the same decision.
    pub fn evaluate(&self, experiment_id: &str) -> Result<EvalDecision, DecisionError> {
        let exps = self.experiments.lock().unwrap();
        let exp = exps.get(experiment_id).ok_or_else(|| {
            DecisionError::Invariant(format!("evaluate of unknown experiment {}", experiment_id))
        })?;
        if exp.state == ExperimentState::Closed {
            return Ok(EvalDecision::NoOp);
        }
        let control = exp.variant(&exp.control_id).ok_or_else(|| {
            DecisionError::Invariant(format!("experiment {} lost its control", exp.id))
        })?;

        // (variant id, lift, impressions, p) for each significant arm.
        let mut winners: Vec<(String, f64, u64, f64)> = Vec::new();
        let mut losers: Vec<(String, f64, u64, f64)> = Vec::new();

        for v in exp.variants.iter().filter(|v| v.id != exp.control_id) {
            if v.impressions == 0 {
                continue;
            }
            if v.impressions < self.cfg.min_sample_size
                || control.impressions < self.cfg.min_sample_size
            {
                continue;
            }
            let t = match stats::two_proportion(
                control.impressions,
                control.conversions,
                v.impressions,
                v.conversions,
            ) {
                Some(t) => t,
                None => continue,
            };
            let lift = v.conversion_rate() - control.conversion_rate();
            if t.p_improve < self.cfg.alpha && lift > 0.0 {
                winners.push((v.id.clone(), lift, v.impressions, t.p_improve));
            } else if t.p_degrade < self.cfg.alpha && lift < 0.0 {
                losers.push((v.id.clone(), lift, v.impressions, t.p_degrade));
            }
        }

        // Best lift wins; ties prefer the larger sample, then the
        // lexicographically smaller id.
        let by_preference = |a: &(String, f64, u64, f64), b: &(String, f64, u64, f64)| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.cmp(&a.2))
                .then(a.0.cmp(&b.0))
        };

        if !winners.is_empty() {
            winners.sort_by(by_preference);
            let (variant, lift, _, p_value) = winners.remove(0);
            return Ok(EvalDecision::Promote { variant, p_value, lift });
        }
        if !losers.is_empty() {
            // Most negative lift first.
            losers.sort_by(|a, b| by_preference(b, a));
            let (variant, _, _, p_value) = losers.remove(0);
            return Ok(EvalDecision::Retire { variant, p_value });
        }
        if control.impressions >= self.cfg.max_sample_size {
            return Ok(EvalDecision::Close { winner: None });
        }
        Ok(EvalDecision::NoOp)
    }

    /// Execute a decision's weight moves. Weights always sum to 1 after any
    /// promote / retire / close; violating that aborts with an invariant
    /// error before state is persisted.
    pub fn apply(
        &self,
        experiment_id: &str,
        decision: &EvalDecision,
    ) -> Result<(), DecisionError> {
        let mut exps = self.experiments.lock().unwrap();
        let exp = exps.get_mut(experiment_id).ok_or_else(|| {
            DecisionError::Invariant(format!("apply to unknown experiment {}", experiment_id))
        })?;

        match decision {
            EvalDecision::NoOp => return Ok(()),
            EvalDecision::Promote { variant, .. } => {
                if exp.state == ExperimentState::Closed {
                    return Ok(());
                }
                let current = exp
                    .variant(variant)
                    .map(|v| v.weight)
                    .ok_or_else(|| DecisionError::Invariant(format!("promote of unknown variant {}", variant)))?;
                // Double, bounded by the configured single-step cap, so a
                // noisy early lead cannot grab all traffic at once.
                let stepped = (current * 2.0)
                    .min(current + self.cfg.promote_step_cap)
                    .min(1.0);
                if stepped >= self.cfg.close_weight {
                    shift_all_traffic(exp, variant);
                    exp.state = ExperimentState::Closed;
                } else {
                    let rest_old = 1.0 - current;
                    let scale = if rest_old > 0.0 { (1.0 - stepped) / rest_old } else { 0.0 };
                    for v in exp.variants.iter_mut() {
                        if v.id == *variant {
                            v.weight = stepped;
                        } else {
                            v.weight *= scale;
                        }
                    }
                    exp.state = ExperimentState::Significant;
                }
            }
            EvalDecision::Retire { variant, .. } => {
                if *variant == exp.control_id {
                    return Err(DecisionError::Invariant(format!(
                        "experiment {}: cannot retire control",
                        exp.id
                    )));
                }
                let retired = exp
                    .variant(variant)
                    .map(|v| v.weight)
                    .ok_or_else(|| DecisionError::Invariant(format!("retire of unknown variant {}", variant)))?;
                let rest_old = 1.0 - retired;
                if rest_old <= 0.0 {
                    return Err(DecisionError::Invariant(format!(
                        "experiment {}: retiring the only live variant",
                        exp.id
                    )));
                }
                for v in exp.variants.iter_mut() {
                    if v.id == *variant {
                        v.weight = 0.0;
                    } else {
                        v.weight /= rest_old;
                    }
                }
            }
            EvalDecision::Close { winner } => {
                let target = winner.clone().unwrap_or_else(|| exp.control_id.clone());
                shift_all_traffic(exp, &target);
                exp.state = ExperimentState::Closed;
            }
        }

        exp.validate_weights()?;
        self.persist_experiment(exp)?;
        logging::log_evaluation(experiment_id, decision.label(), &format!("{:?}", decision));
        Ok(())
    }

    /// Evaluate then apply, returning the decision taken.
    pub fn evaluate_and_apply(&self, experiment_id: &str) -> Result<EvalDecision, DecisionError> {
        let decision = self.evaluate(experiment_id)?;
        if decision != EvalDecision::NoOp {
            self.apply(experiment_id, &decision)?;
        }
        Ok(decision)
    }

    // ----- persistence -----

    fn persist_experiment(&self, exp: &Experiment) -> Result<(), DecisionError> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(()),
        };
        let mut conn = store.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO experiments (id, control_id, state, created_ts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state",
            params![exp.id, exp.control_id, exp.state.as_str(), exp.created_ts as i64],
        )?;
        for (position, v) in exp.variants.iter().enumerate() {
            tx.execute(
                "INSERT INTO variants (experiment_id, id, position, weight, impressions, conversions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(experiment_id, id) DO UPDATE SET
                     weight = excluded.weight,
                     impressions = excluded.impressions,
                     conversions = excluded.conversions",
                params![
                    exp.id,
                    v.id,
                    position as i64,
                    v.weight,
                    v.impressions as i64,
                    v.conversions as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn persist_counters(&self, exp: &Experiment) -> Result<(), DecisionError> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(()),
        };
        let conn = store.lock().unwrap();
        for v in &exp.variants {
            conn.execute(
                "UPDATE variants SET impressions = ?1, conversions = ?2
                 WHERE experiment_id = ?3 AND id = ?4",
                params![v.impressions as i64, v.conversions as i64, exp.id, v.id],
            )?;
        }
        Ok(())
    }

    fn persist_assignment(
        &self,
        experiment_id: &str,
        subject_id: &str,
        variant_id: &str,
    ) -> Result<(), DecisionError> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(()),
        };
        let conn = store.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO assignments (experiment_id, subject_id, variant_id)
             VALUES (?1, ?2, ?3)",
            params![experiment_id, subject_id, variant_id],
        )?;
        Ok(())
    }

    /// Stored assignment lookup, used by restart tests.
    pub fn stored_assignment(
        &self,
        experiment_id: &str,
        subject_id: &str,
    ) -> Result<Option<String>, DecisionError> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(None),
        };
        let conn = store.lock().unwrap();
        let found = conn
            .query_row(
                "SELECT variant_id FROM assignments WHERE experiment_id = ?1 AND subject_id = ?2",
                params![experiment_id, subject_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(found)
    }
}

fn shift_all_traffic(exp: &mut Experiment, winner: &str) {
    for v in exp.variants.iter_mut() {
        v.weight = if v.id == winner { 1.0 } else { 0.0 };
    }
}
