//! Core action and subject types flowing through the decision pipeline.
//!
//! A [`ProposedAction`] is immutable once constructed; every downstream
//! component reads it, none mutate it. The `id` field doubles as the
//! idempotency key: submitting the same id twice must yield one decision.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage,
    ApplyIncentive,
    ChangeLifecycleStage,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SendMessage => "send_message",
            ActionKind::ApplyIncentive => "apply_incentive",
            ActionKind::ChangeLifecycleStage => "change_lifecycle_stage",
        }
    }

    /// Kinds that reach the customer directly and therefore need consent.
    pub fn is_outbound(&self) -> bool {
        matches!(self, ActionKind::SendMessage | ActionKind::ApplyIncentive)
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "send_message" => Some(ActionKind::SendMessage),
            "apply_incentive" => Some(ActionKind::ApplyIncentive),
            "change_lifecycle_stage" => Some(ActionKind::ChangeLifecycleStage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    #[serde(rename = "whatsapp")]
    WhatsApp,
    Push,
    Web,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::WhatsApp => "whatsapp",
            Channel::Push => "push",
            Channel::Web => "web",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "whatsapp" => Some(Channel::WhatsApp),
            "push" => Some(Channel::Push),
            "web" => Some(Channel::Web),
            _ => None,
        }
    }
}

/// Declared payload fields. The content itself lives with the creative
/// collaborator; only the fields guardrails need are carried here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    /// Opaque reference to the rendered content (template id, asset key).
    pub content_ref: String,
    pub subject_line: Option<String>,
    pub body_text: Option<String>,
    /// Declared discount magnitude in percent, if the action carries one.
    pub discount_pct: Option<f64>,
    /// Externally supplied tone-consistency score (0.0-1.0).
    pub tone_score: Option<f64>,
}

/// The unit of work entering the pipeline. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    /// Caller-supplied unique idempotency identifier.
    pub id: String,
    pub subject_id: String,
    pub kind: ActionKind,
    pub channel: Channel,
    pub payload: Payload,
    /// Epoch milliseconds at which the caller requested the action.
    pub requested_ts: u64,
    pub experiment_id: Option<String>,
}

/// Read-only per-subject state the guardrails consume. Resolved once per
/// `decide` call from a [`SnapshotProvider`]; never written by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub subject_id: String,
    pub consent: bool,
    /// Epoch ms of the most recent consent record, if any.
    pub consent_ts: Option<u64>,
    pub region: String,
    pub engagement_score: f64,
    pub lifetime_value: f64,
}

#[derive(Debug, Clone)]
pub struct SnapshotUnavailable {
    pub reason: String,
}

impl fmt::Display for SnapshotUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject snapshot unavailable: {}", self.reason)
    }
}

/// Bounded-latency lookup of subject state. Implementations must respect
/// the supplied timeout; on expiry they return `Err` and the pipeline
/// fails the action's guardrails closed.
pub trait SnapshotProvider: Send + Sync {
    fn fetch(
        &self,
        subject_id: &str,
        timeout: Duration,
    ) -> Result<SubjectSnapshot, SnapshotUnavailable>;
}

/// In-memory provider for tests and the demo loop.
#[derive(Default)]
pub struct StaticSnapshots {
    subjects: Mutex<HashMap<String, SubjectSnapshot>>,
}

impl StaticSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: SubjectSnapshot) {
        let mut map = self.subjects.lock().unwrap();
        map.insert(snapshot.subject_id.clone(), snapshot);
    }
}

impl SnapshotProvider for StaticSnapshots {
    fn fetch(
        &self,
        subject_id: &str,
        _timeout: Duration,
    ) -> Result<SubjectSnapshot, SnapshotUnavailable> {
        let map = self.subjects.lock().unwrap();
        map.get(subject_id).cloned().ok_or_else(|| SnapshotUnavailable {
            reason: format!("unknown subject {}", subject_id),
        })
    }
}
