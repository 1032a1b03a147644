use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::action::Channel;

/// Pipeline configuration. Every limit is an env var with a default so
/// deployments can tune caps without a rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub sqlite_path: String,
    // === Frequency caps ===
    /// Rolling window for frequency counting, in ms (default 7 days).
    pub frequency_window_ms: u64,
    pub cap_email: u32,
    pub cap_sms: u32,
    pub cap_whatsapp: u32,
    pub cap_push: u32,
    pub cap_web: u32,
    // === Compliance ===
    /// Consent records older than this are treated as stale (ms).
    pub consent_max_age_ms: u64,
    // === Engagement ===
    pub min_engagement_score: f64,
    // === Tone ===
    pub tone_threshold: f64,
    /// Width of the borderline band just below the threshold; scores inside
    /// it escalate instead of hard-failing.
    pub tone_borderline_band: f64,
    pub forbidden_terms: Vec<String>,
    pub spam_triggers: Vec<String>,
    // === Financial ===
    pub discount_auto_approve_pct: f64,
    pub discount_max_pct: f64,
    // === Experiments ===
    pub alpha: f64,
    /// Variants below this sample size are excluded from significance.
    pub min_sample_size: u64,
    /// Control reaching this sample size with no winner closes the experiment.
    pub max_sample_size: u64,
    /// Maximum absolute weight increase a promotion step may apply.
    pub promote_step_cap: f64,
    /// Winner weight at which the experiment closes and traffic fully shifts.
    pub close_weight: f64,
    // === Pipeline ===
    pub snapshot_timeout_ms: u64,
    pub persist_every_secs: u64,
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH")
                .unwrap_or_else(|_| "./campaignfx.sqlite".to_string()),
            frequency_window_ms: env_u64("FREQ_WINDOW_MS", 7 * 86_400_000),
            cap_email: env_u32("CAP_EMAIL", 3),
            cap_sms: env_u32("CAP_SMS", 2),
            cap_whatsapp: env_u32("CAP_WHATSAPP", 2),
            cap_push: env_u32("CAP_PUSH", 5),
            cap_web: env_u32("CAP_WEB", 10),
            consent_max_age_ms: env_u64("CONSENT_MAX_AGE_MS", 730 * 86_400_000),
            min_engagement_score: env_f64("MIN_ENGAGEMENT", 0.3),
            tone_threshold: env_f64("TONE_TH", 0.85),
            tone_borderline_band: env_f64("TONE_BAND", 0.10),
            forbidden_terms: env_list(
                "FORBIDDEN_TERMS",
                &["guaranteed", "risk free", "miracle", "no strings attached"],
            ),
            spam_triggers: env_list(
                "SPAM_TRIGGERS",
                &[
                    "click here now",
                    "urgent",
                    "act now",
                    "limited time",
                    "free",
                    "no credit card",
                    "verify account",
                ],
            ),
            discount_auto_approve_pct: env_f64("DISCOUNT_AUTO_PCT", 20.0),
            discount_max_pct: env_f64("DISCOUNT_MAX_PCT", 30.0),
            alpha: env_f64("ALPHA", 0.05),
            min_sample_size: env_u64("MIN_SAMPLE", 1000),
            max_sample_size: env_u64("MAX_SAMPLE", 100_000),
            promote_step_cap: env_f64("PROMOTE_STEP_CAP", 0.25),
            close_weight: env_f64("CLOSE_WEIGHT", 0.8),
            snapshot_timeout_ms: env_u64("SNAPSHOT_TIMEOUT_MS", 250),
            persist_every_secs: env_u64("PERSIST_SECS", 300),
        }
    }

    /// Frequency cap for one channel's rolling window.
    pub fn cap(&self, channel: Channel) -> u32 {
        match channel {
            Channel::Email => self.cap_email,
            Channel::Sms => self.cap_sms,
            Channel::WhatsApp => self.cap_whatsapp,
            Channel::Push => self.cap_push,
            Channel::Web => self.cap_web,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Stable hash of the full configuration, for audit manifests.
    pub fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_json().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_env();
        assert_eq!(cfg.cap(Channel::Email), 3);
        assert!(cfg.alpha > 0.0 && cfg.alpha < 1.0);
        assert!(cfg.tone_borderline_band < cfg.tone_threshold);
    }

    #[test]
    fn test_config_hash_deterministic() {
        let cfg1 = Config::from_env();
        let cfg2 = Config::from_env();
        assert_eq!(cfg1.config_hash(), cfg2.config_hash());
        assert_eq!(cfg1.config_hash().len(), 64);
    }

    #[test]
    fn test_config_json_round_trip() {
        let cfg = Config::from_env();
        let json = cfg.to_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["tone_threshold"].is_number());
        assert!(parsed["forbidden_terms"].is_array());
    }
}
