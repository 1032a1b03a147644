//! Guardrail evaluation engine.
//!
//! Each registered check returns PASS / FAIL / ESCALATE plus a reason; the
//! engine aggregates them into one [`Verdict`] with strict dominance:
//! any FAIL rejects, otherwise any ESCALATE pends review, otherwise the
//! action is approved. The verdict is a pure function of the result set.
//!
//! The engine never overrides itself; converting a rejection to an approval
//! is the human-review surface's job and lands as a correction record in
//! the audit ledger.

pub mod checks;
pub mod frequency;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::{ActionKind, ProposedAction, SubjectSnapshot};
use crate::config::Config;
use crate::logging;

use self::frequency::{FrequencyLedger, Reservation};

/// Reason used by every check that is missing a required input.
pub const UNAVAILABLE: &str = "check unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckVerdict {
    Pass,
    Fail,
    Escalate,
}

impl CheckVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckVerdict::Pass => "pass",
            CheckVerdict::Fail => "fail",
            CheckVerdict::Escalate => "escalate",
        }
    }
}

/// One check's outcome for one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub check: String,
    pub verdict: CheckVerdict,
    pub reason: String,
    /// Bounded score where the check computes one (tone consistency,
    /// discount magnitude, engagement). Always within 0.0-1.0.
    pub score: Option<f64>,
}

impl GuardrailResult {
    pub fn pass(check: &str, reason: &str) -> Self {
        Self { check: check.to_string(), verdict: CheckVerdict::Pass, reason: reason.to_string(), score: None }
    }

    pub fn pass_scored(check: &str, reason: &str, score: f64) -> Self {
        Self { score: Some(score), ..Self::pass(check, reason) }
    }

    pub fn fail(check: &str, reason: &str) -> Self {
        Self { check: check.to_string(), verdict: CheckVerdict::Fail, reason: reason.to_string(), score: None }
    }

    pub fn fail_scored(check: &str, reason: &str, score: f64) -> Self {
        Self { score: Some(score), ..Self::fail(check, reason) }
    }

    pub fn escalate(check: &str, reason: &str) -> Self {
        Self { check: check.to_string(), verdict: CheckVerdict::Escalate, reason: reason.to_string(), score: None }
    }

    pub fn escalate_scored(check: &str, reason: &str, score: f64) -> Self {
        Self { score: Some(score), ..Self::escalate(check, reason) }
    }
}

/// Aggregate decision over all guardrails for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
    PendingReview,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::Rejected => "rejected",
            Verdict::PendingReview => "pending_review",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(Verdict::Approved),
            "rejected" => Some(Verdict::Rejected),
            "pending_review" => Some(Verdict::PendingReview),
            _ => None,
        }
    }
}

/// FAIL dominates ESCALATE, which dominates PASS-only.
pub fn aggregate(results: &[GuardrailResult]) -> Verdict {
    let mut escalated = false;
    for r in results {
        match r.verdict {
            CheckVerdict::Fail => return Verdict::Rejected,
            CheckVerdict::Escalate => escalated = true,
            CheckVerdict::Pass => {}
        }
    }
    if escalated {
        Verdict::PendingReview
    } else {
        Verdict::Approved
    }
}

/// Extension point for caller-supplied checks beyond the built-in set.
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(
        &self,
        action: &ProposedAction,
        snapshot: Option<&SubjectSnapshot>,
        cfg: &Config,
    ) -> GuardrailResult;
}

/// Output of one evaluation. The reservation (present when the frequency
/// check passed for a send) must be committed once the decision is durable,
/// or released if it never becomes durable.
pub struct Evaluation {
    pub verdict: Verdict,
    pub results: Vec<GuardrailResult>,
    pub reservation: Option<Reservation>,
}

pub struct GuardrailEngine {
    cfg: Config,
    frequency: Arc<FrequencyLedger>,
    extra: Vec<Box<dyn Check>>,
}

impl GuardrailEngine {
    pub fn new(cfg: Config, frequency: Arc<FrequencyLedger>) -> Self {
        Self { cfg, frequency, extra: Vec::new() }
    }

    /// Register an additional check. Runs after the built-in set.
    pub fn register(&mut self, check: Box<dyn Check>) {
        self.extra.push(check);
    }

    /// Run every registered check and aggregate. All checks are pure except
    /// frequency, whose read-then-reserve is atomic per subject+channel.
    pub fn evaluate(
        &self,
        action: &ProposedAction,
        snapshot: Option<&SubjectSnapshot>,
    ) -> Evaluation {
        let mut results = Vec::with_capacity(5 + self.extra.len());

        let reservation = self.frequency_check(action, &mut results);
        results.push(checks::compliance(action, snapshot, &self.cfg));
        results.push(checks::tone(action, &self.cfg));
        results.push(checks::financial(action, &self.cfg));
        results.push(checks::engagement(action, snapshot, &self.cfg));
        for check in &self.extra {
            results.push(check.run(action, snapshot, &self.cfg));
        }

        for r in &results {
            if r.verdict != CheckVerdict::Pass {
                logging::log_check(&action.id, &r.check, r.verdict.as_str(), &r.reason);
            }
        }

        let verdict = aggregate(&results);
        let failed = results.iter().filter(|r| r.verdict == CheckVerdict::Fail).count();
        logging::log_verdict(&action.id, &action.subject_id, verdict.as_str(), failed);

        Evaluation { verdict, results, reservation }
    }

    fn frequency_check(
        &self,
        action: &ProposedAction,
        results: &mut Vec<GuardrailResult>,
    ) -> Option<Reservation> {
        if action.kind != ActionKind::SendMessage {
            results.push(GuardrailResult::pass("frequency", "not applicable"));
            return None;
        }
        let cap = self.cfg.cap(action.channel);
        let (count, reservation) = self.frequency.check_and_reserve(
            &action.subject_id,
            action.channel,
            action.requested_ts,
            cap,
            self.cfg.frequency_window_ms,
        );
        let occupancy = (count as f64 / cap.max(1) as f64).min(1.0);
        if reservation.is_some() {
            results.push(GuardrailResult::pass_scored(
                "frequency",
                &format!("{}/{} in window", count, cap),
                occupancy,
            ));
        } else {
            results.push(GuardrailResult::fail_scored(
                "frequency",
                &format!("cap reached: {}/{} in window", count, cap),
                occupancy,
            ));
        }
        reservation
    }
}
