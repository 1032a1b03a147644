//! Error taxonomy for the decision pipeline.
//!
//! Guardrail check failures are never errors — they are data
//! (`GuardrailResult`), so a broken check fails an action closed instead of
//! crashing the pipeline. Policy rejection and review-required travel in the
//! `Verdict`, not here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecisionError {
    /// The caller canceled before any state was touched. No audit record.
    #[error("decide canceled before start")]
    Canceled,

    /// A dependency failed in a retryable way (durability write failed,
    /// store unavailable). Safe to retry with the same action id.
    #[error("transient dependency failure: {0}")]
    Transient(String),

    /// An override request that is not legal: unknown record, record not in
    /// an overridable verdict, or an empty reason.
    #[error("invalid override: {0}")]
    InvalidOverride(String),

    /// Internal consistency broken (non-monotonic audit sequence, variant
    /// weights not summing to 1). Fatal for the offending operation; never
    /// continue with inconsistent state.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl DecisionError {
    /// Callers may retry only transient failures; the idempotency key makes
    /// the retry safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DecisionError::Transient(_))
    }
}

impl From<rusqlite::Error> for DecisionError {
    fn from(err: rusqlite::Error) -> Self {
        DecisionError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(DecisionError::Transient("disk".into()).is_retryable());
        assert!(!DecisionError::Canceled.is_retryable());
        assert!(!DecisionError::Invariant("seq".into()).is_retryable());
        assert!(!DecisionError::InvalidOverride("empty reason".into()).is_retryable());
    }
}
