use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use campaignfx::action::{
    ActionKind, Channel, Payload, ProposedAction, StaticSnapshots, SubjectSnapshot,
};
use campaignfx::config::Config;
use campaignfx::experiment::{Allocator, Experiment, Variant};
use campaignfx::ledger::SqliteLedger;
use campaignfx::logging::{self, obj, v_str};
use campaignfx::pipeline::Pipeline;

/// Demo loop: drives the pipeline with a synthetic action stream so the
/// whole decision path (guardrails → allocation → audit) can be observed
/// end to end without any real campaign collaborators attached.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    logging::log(
        logging::Level::Info,
        logging::Domain::System,
        "startup",
        obj(&[
            ("config_hash", v_str(&cfg.config_hash())),
            ("sqlite_path", v_str(&cfg.sqlite_path)),
        ]),
    );

    let ledger = Arc::new(SqliteLedger::open(&cfg.sqlite_path)?);
    let allocator = Arc::new(Allocator::open(cfg.clone(), &cfg.sqlite_path)?);
    allocator.register(Experiment::new(
        "exp-subject-lines",
        "control",
        vec![
            Variant::new("control", 0.4),
            Variant::new("curiosity", 0.3),
            Variant::new("benefit", 0.3),
        ],
        logging::ts_epoch_ms(),
    )?)?;

    let snapshots = Arc::new(StaticSnapshots::new());
    let mut rng = rand::thread_rng();
    let subject_count = 40usize;
    for i in 0..subject_count {
        let now = logging::ts_epoch_ms();
        snapshots.insert(SubjectSnapshot {
            subject_id: format!("subject-{}", i),
            consent: rng.gen_bool(0.9),
            consent_ts: Some(now - rng.gen_range(0..90 * 86_400_000)),
            region: if i % 3 == 0 { "US".to_string() } else { "EU".to_string() },
            engagement_score: rng.gen_range(0.0..1.0),
            lifetime_value: rng.gen_range(20.0..2_000.0),
        });
    }

    let pipeline = Pipeline::new(cfg.clone(), ledger, allocator.clone(), snapshots)?;

    let mut tick = 0u64;
    let mut last_flush = std::time::Instant::now();
    loop {
        tick += 1;
        let subject_id = format!("subject-{}", rng.gen_range(0..subject_count));
        let action = ProposedAction {
            id: Uuid::new_v4().to_string(),
            subject_id,
            kind: ActionKind::SendMessage,
            channel: Channel::Email,
            payload: Payload {
                content_ref: "tpl-digest".to_string(),
                subject_line: Some("Your weekly picks".to_string()),
                body_text: Some("We pulled together a few things you might like.".to_string()),
                discount_pct: if rng.gen_bool(0.2) { Some(rng.gen_range(5.0..35.0)) } else { None },
                tone_score: Some(rng.gen_range(0.6..1.0)),
            },
            requested_ts: logging::ts_epoch_ms(),
            experiment_id: Some("exp-subject-lines".to_string()),
        };

        match pipeline.decide(&action, None) {
            Ok(outcome) => {
                // Simulated conversion feedback for assigned variants.
                if let Some(variant) = &outcome.variant_id {
                    if rng.gen_bool(0.04) {
                        allocator.record_outcome("exp-subject-lines", variant)?;
                    }
                }
            }
            Err(err) => {
                logging::log(
                    logging::Level::Error,
                    logging::Domain::Pipeline,
                    "decide_failed",
                    obj(&[("action_id", v_str(&action.id)), ("msg", v_str(&err.to_string()))]),
                );
            }
        }

        if tick % 200 == 0 {
            let decision = allocator.evaluate_and_apply("exp-subject-lines")?;
            logging::log_evaluation("exp-subject-lines", decision.label(), &format!("{:?}", decision));
        }
        if last_flush.elapsed().as_secs() >= cfg.persist_every_secs {
            pipeline.flush_stats();
            last_flush = std::time::Instant::now();
        }

        sleep(Duration::from_millis(250)).await;
    }
}
