//! Built-in guardrail checks.
//!
//! Every check is a pure function of (action, snapshot, limits). A check
//! that cannot complete for lack of a required input fails closed with
//! reason "check unavailable" — never open. The frequency check lives in
//! the engine because it is the only one touching shared mutable state.

use crate::action::{ActionKind, ProposedAction, SubjectSnapshot};
use crate::config::Config;

use super::{GuardrailResult, UNAVAILABLE};

/// Consent present and fresh. Hard-fails only; never escalates.
pub fn compliance(
    action: &ProposedAction,
    snapshot: Option<&SubjectSnapshot>,
    cfg: &Config,
) -> GuardrailResult {
    if !action.kind.is_outbound() {
        return GuardrailResult::pass("compliance", "not applicable");
    }
    let snap = match snapshot {
        Some(s) => s,
        None => return GuardrailResult::fail("compliance", UNAVAILABLE),
    };
    if !snap.consent {
        return GuardrailResult::fail("compliance", "consent record missing");
    }
    let consent_ts = match snap.consent_ts {
        Some(ts) => ts,
        None => return GuardrailResult::fail("compliance", "consent age unknown"),
    };
    let age = action.requested_ts.saturating_sub(consent_ts);
    if age > cfg.consent_max_age_ms {
        return GuardrailResult::fail(
            "compliance",
            &format!("consent stale: {}d old", age / 86_400_000),
        );
    }
    GuardrailResult::pass("compliance", "consent fresh")
}

/// Forbidden terms hard-fail; a low consistency score fails, a score in the
/// borderline band just below the threshold escalates for human review.
pub fn tone(action: &ProposedAction, cfg: &Config) -> GuardrailResult {
    if action.kind != ActionKind::SendMessage {
        return GuardrailResult::pass("tone", "not applicable");
    }

    let subject = action.payload.subject_line.as_deref().unwrap_or("");
    let body = action.payload.body_text.as_deref().unwrap_or("");
    if subject.is_empty() && body.is_empty() {
        return GuardrailResult::fail("tone", UNAVAILABLE);
    }
    let text = format!("{} {}", subject, body).to_lowercase();

    for term in &cfg.forbidden_terms {
        if text.contains(term.as_str()) {
            return GuardrailResult::fail_scored(
                "tone",
                &format!("forbidden term: {}", term),
                0.0,
            );
        }
    }

    let mut spam_hits = 0u32;
    for trigger in &cfg.spam_triggers {
        if text.contains(trigger.as_str()) {
            spam_hits += 1;
        }
    }
    if shouting_runs(subject) > 2 {
        spam_hits += 1;
    }
    if text.contains("!!") {
        spam_hits += 1;
    }
    let derived = 1.0 - (spam_hits as f64 / 5.0).min(1.0);

    // Supplied score caps the derived one: spam triggers still bite even
    // when the upstream scorer was generous.
    let score = match action.payload.tone_score {
        Some(s) => s.clamp(0.0, 1.0).min(derived),
        None => derived,
    };

    let floor = cfg.tone_threshold - cfg.tone_borderline_band;
    if score < floor {
        GuardrailResult::fail_scored("tone", &format!("consistency {:.2} below floor", score), score)
    } else if score < cfg.tone_threshold {
        GuardrailResult::escalate_scored(
            "tone",
            &format!("consistency {:.2} borderline", score),
            score,
        )
    } else {
        GuardrailResult::pass_scored("tone", "within guidelines", score)
    }
}

/// Count runs of 3+ consecutive uppercase letters (shouting).
fn shouting_runs(text: &str) -> u32 {
    let mut runs = 0u32;
    let mut streak = 0u32;
    for c in text.chars() {
        if c.is_ascii_uppercase() {
            streak += 1;
            if streak == 3 {
                runs += 1;
            }
        } else {
            streak = 0;
        }
    }
    runs
}

/// Declared incentive magnitude: escalate above the auto-approve ceiling,
/// hard-fail above the absolute maximum.
pub fn financial(action: &ProposedAction, cfg: &Config) -> GuardrailResult {
    let discount = match action.payload.discount_pct {
        Some(d) => d,
        None => {
            if action.kind == ActionKind::ApplyIncentive {
                return GuardrailResult::fail("financial", UNAVAILABLE);
            }
            return GuardrailResult::pass("financial", "no declared incentive");
        }
    };
    if !discount.is_finite() || discount < 0.0 {
        return GuardrailResult::fail("financial", "invalid discount magnitude");
    }
    let score = (discount / cfg.discount_max_pct).min(1.0);
    if discount > cfg.discount_max_pct {
        GuardrailResult::fail_scored(
            "financial",
            &format!("discount {:.1}% above absolute max {:.1}%", discount, cfg.discount_max_pct),
            score,
        )
    } else if discount > cfg.discount_auto_approve_pct {
        GuardrailResult::escalate_scored(
            "financial",
            &format!(
                "discount {:.1}% above auto-approve ceiling {:.1}%",
                discount, cfg.discount_auto_approve_pct
            ),
            score,
        )
    } else {
        GuardrailResult::pass_scored("financial", "within auto-approve ceiling", score)
    }
}

/// Sends to disengaged subjects fail; spam complaints start with messages
/// nobody asked for.
pub fn engagement(
    action: &ProposedAction,
    snapshot: Option<&SubjectSnapshot>,
    cfg: &Config,
) -> GuardrailResult {
    if action.kind != ActionKind::SendMessage {
        return GuardrailResult::pass("engagement", "not applicable");
    }
    let snap = match snapshot {
        Some(s) => s,
        None => return GuardrailResult::fail("engagement", UNAVAILABLE),
    };
    let score = snap.engagement_score.clamp(0.0, 1.0);
    if score < cfg.min_engagement_score {
        GuardrailResult::fail_scored(
            "engagement",
            &format!("engagement {:.2} below floor {:.2}", score, cfg.min_engagement_score),
            score,
        )
    } else {
        GuardrailResult::pass_scored("engagement", "engaged subject", score)
    }
}
