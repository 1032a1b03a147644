//! Per-subject, per-channel sliding frequency windows.
//!
//! The frequency check is the one guardrail with shared mutable state. Its
//! read-then-increment must be atomic per subject+channel: two concurrent
//! evaluations for the same subject must never both observe "under cap".
//! The map holds one mutex per key; the outer lock only guards map access,
//! so different subjects never contend on the same window.
//!
//! A passing check *reserves* a slot. The reservation is committed when the
//! decision's audit record lands and released if the append fails, so a
//! caller retry with the same action id cannot double-count.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::action::Channel;

type Key = (String, Channel);

#[derive(Debug, Default)]
struct Window {
    /// Epoch-ms timestamps of committed sends, oldest first.
    sends: VecDeque<u64>,
    /// Slots handed out but not yet committed to an audit record.
    reserved: u32,
}

impl Window {
    fn prune(&mut self, now: u64, window_ms: u64) {
        let floor = now.saturating_sub(window_ms);
        while let Some(&ts) = self.sends.front() {
            if ts < floor {
                self.sends.pop_front();
            } else {
                break;
            }
        }
    }

    fn occupancy(&self) -> u32 {
        self.sends.len() as u32 + self.reserved
    }
}

/// A slot handed out by [`FrequencyLedger::check_and_reserve`]. Must be
/// committed or released exactly once.
#[derive(Debug)]
pub struct Reservation {
    subject_id: String,
    channel: Channel,
    ts: u64,
}

#[derive(Default)]
pub struct FrequencyLedger {
    windows: Mutex<HashMap<Key, Arc<Mutex<Window>>>>,
}

impl FrequencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, subject_id: &str, channel: Channel) -> Arc<Mutex<Window>> {
        let mut map = self.windows.lock().unwrap();
        map.entry((subject_id.to_string(), channel))
            .or_insert_with(|| Arc::new(Mutex::new(Window::default())))
            .clone()
    }

    /// Atomic read-then-reserve. Returns the occupancy observed and, when it
    /// is below `cap`, a reservation for one slot.
    pub fn check_and_reserve(
        &self,
        subject_id: &str,
        channel: Channel,
        now: u64,
        cap: u32,
        window_ms: u64,
    ) -> (u32, Option<Reservation>) {
        let slot = self.window(subject_id, channel);
        let mut w = slot.lock().unwrap();
        w.prune(now, window_ms);
        let count = w.occupancy();
        if count >= cap {
            return (count, None);
        }
        w.reserved += 1;
        (
            count,
            Some(Reservation {
                subject_id: subject_id.to_string(),
                channel,
                ts: now,
            }),
        )
    }

    /// Convert a reservation into a committed send.
    pub fn commit(&self, reservation: Reservation) {
        let slot = self.window(&reservation.subject_id, reservation.channel);
        let mut w = slot.lock().unwrap();
        w.reserved = w.reserved.saturating_sub(1);
        w.sends.push_back(reservation.ts);
    }

    /// Hand a reserved slot back (the decision never became durable).
    pub fn release(&self, reservation: Reservation) {
        let slot = self.window(&reservation.subject_id, reservation.channel);
        let mut w = slot.lock().unwrap();
        w.reserved = w.reserved.saturating_sub(1);
    }

    /// Current occupancy without reserving.
    pub fn count(&self, subject_id: &str, channel: Channel, now: u64, window_ms: u64) -> u32 {
        let slot = self.window(subject_id, channel);
        let mut w = slot.lock().unwrap();
        w.prune(now, window_ms);
        w.occupancy()
    }

    /// Inject a historical send during recovery (rebuilt from the audit
    /// ledger, which is the durable source of truth for committed sends).
    pub fn restore(&self, subject_id: &str, channel: Channel, ts: u64) {
        let slot = self.window(subject_id, channel);
        let mut w = slot.lock().unwrap();
        // Keep the deque ordered; recovery replays records in seq order but
        // requested timestamps may interleave.
        let pos = w.sends.iter().position(|&t| t > ts).unwrap_or(w.sends.len());
        w.sends.insert(pos, ts);
    }
}
