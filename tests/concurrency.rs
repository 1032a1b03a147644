//! Concurrency properties: the pipeline is invoked by many independent
//! callers, and the per-subject invariants must hold under contention.

use std::sync::Arc;
use std::thread;

use rand::Rng;

use campaignfx::action::{
    ActionKind, Channel, Payload, ProposedAction, StaticSnapshots, SubjectSnapshot,
};
use campaignfx::config::Config;
use campaignfx::experiment::{Allocator, Experiment, Variant};
use campaignfx::guardrail::Verdict;
use campaignfx::ledger::{AuditLedger, MemoryLedger, RecordFilter};
use campaignfx::pipeline::Pipeline;

const TS: u64 = 1_700_000_000_000;

fn consenting_subject(id: &str) -> SubjectSnapshot {
    SubjectSnapshot {
        subject_id: id.to_string(),
        consent: true,
        consent_ts: Some(TS - 3_600_000),
        region: "EU".to_string(),
        engagement_score: 0.8,
        lifetime_value: 500.0,
    }
}

fn send_action(id: &str, subject_id: &str) -> ProposedAction {
    ProposedAction {
        id: id.to_string(),
        subject_id: subject_id.to_string(),
        kind: ActionKind::SendMessage,
        channel: Channel::Email,
        payload: Payload {
            content_ref: "tpl-digest".to_string(),
            subject_line: Some("Your weekly picks".to_string()),
            body_text: Some("A few things you might like.".to_string()),
            discount_pct: None,
            tone_score: Some(0.95),
        },
        requested_ts: TS,
        experiment_id: Some("exp-1".to_string()),
    }
}

fn build(subjects: usize) -> (Arc<Pipeline>, Arc<MemoryLedger>) {
    let cfg = Config::from_env();
    let ledger = Arc::new(MemoryLedger::new());
    let allocator = Arc::new(Allocator::in_memory(cfg.clone()));
    allocator
        .register(
            Experiment::new(
                "exp-1",
                "control",
                vec![Variant::new("control", 0.5), Variant::new("challenger", 0.5)],
                TS,
            )
            .unwrap(),
        )
        .unwrap();
    let snapshots = Arc::new(StaticSnapshots::new());
    for i in 0..subjects {
        snapshots.insert(consenting_subject(&format!("s-{}", i)));
    }
    let pipeline = Arc::new(Pipeline::new(cfg, ledger.clone(), allocator, snapshots).unwrap());
    (pipeline, ledger)
}

// ---------------------------------------------------------------------------
// C01: N concurrent submissions of one idempotency id — one record, one
//      verdict for every caller
// ---------------------------------------------------------------------------
#[test]
fn c01_concurrent_idempotency() {
    let (pipeline, ledger) = build(1);

    let mut handles = Vec::new();
    for _ in 0..12 {
        let pipeline = pipeline.clone();
        handles.push(thread::spawn(move || pipeline.decide(&send_action("dup", "s-0"), None).unwrap()));
    }
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let first = &outcomes[0];
    for o in &outcomes {
        assert_eq!(o.audit_seq, first.audit_seq, "all callers observe the same record");
        assert_eq!(o.verdict, first.verdict);
        assert_eq!(o.variant_id, first.variant_id);
    }
    assert_eq!(ledger.read(&RecordFilter::default()).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// C02: Randomized concurrent hammering of one subject never exceeds the cap
// ---------------------------------------------------------------------------
#[test]
fn c02_cap_holds_under_contention() {
    let (pipeline, ledger) = build(1);
    let cap = Config::from_env().cap(Channel::Email) as usize;

    let mut handles = Vec::new();
    for t in 0..6 {
        let pipeline = pipeline.clone();
        handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for i in 0..10 {
                // Random jitter shuffles interleavings between runs.
                std::thread::sleep(std::time::Duration::from_micros(rng.gen_range(0..200)));
                let _ = pipeline.decide(&send_action(&format!("t{}-{}", t, i), "s-0"), None);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let records = ledger.read(&RecordFilter::default()).unwrap();
    let approved = records.iter().filter(|r| r.verdict == Verdict::Approved).count();
    assert_eq!(approved, cap, "approvals within the rolling window equal the cap exactly");
    // Every other submission was rejected, not lost: one record each.
    assert_eq!(records.len(), 60);
}

// ---------------------------------------------------------------------------
// C03: Different subjects proceed independently — the cap of one subject
//      never throttles another
// ---------------------------------------------------------------------------
#[test]
fn c03_subjects_do_not_interfere() {
    let subjects = 8;
    let (pipeline, ledger) = build(subjects);

    let mut handles = Vec::new();
    for s in 0..subjects {
        let pipeline = pipeline.clone();
        handles.push(thread::spawn(move || {
            let outcome =
                pipeline.decide(&send_action(&format!("first-{}", s), &format!("s-{}", s)), None).unwrap();
            assert_eq!(outcome.verdict, Verdict::Approved);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(ledger.read(&RecordFilter::default()).unwrap().len(), subjects);
}

// ---------------------------------------------------------------------------
// C04: Concurrent assignment for one (experiment, subject) pair is sticky
// ---------------------------------------------------------------------------
#[test]
fn c04_assignment_sticky_under_contention() {
    let cfg = Config::from_env();
    let allocator = Arc::new(Allocator::in_memory(cfg));
    allocator
        .register(
            Experiment::new(
                "exp-race",
                "control",
                vec![Variant::new("control", 0.5), Variant::new("challenger", 0.5)],
                TS,
            )
            .unwrap(),
        )
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..12 {
        let allocator = allocator.clone();
        handles.push(thread::spawn(move || allocator.assign("exp-race", "subject-x").unwrap()));
    }
    let assigned: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(assigned.windows(2).all(|w| w[0] == w[1]), "one variant for one subject");

    // Twelve assignments, twelve impressions, all on the same arm.
    let exp = allocator.experiment("exp-race").unwrap();
    let v = exp.variant(&assigned[0]).unwrap();
    assert_eq!(v.impressions, 12);
}
