//! Deterministic execution queue for world commands.
//!
//! Commands addressed to a future sync step wait here, sorted by target
//! step, and are drained exactly when the local simulation reaches that
//! step. Arrival-order jitter between participants disappears because
//! everyone applies the same commands at the same step.

use crate::command::Message;
use log::warn;

/// Verdict on an incoming world command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted and waiting for its target step.
    Queued,
    /// Target step already passed and the command is order-sensitive. The
    /// participant can no longer apply it deterministically.
    Stale,
    /// Issued under a different map counter than the current world.
    WrongEpoch,
}

/// Pending world commands, ordered by target sync step with arrival order
/// preserved within a step.
#[derive(Debug, Default)]
pub struct ExecQueue {
    entries: Vec<Message>,
}

impl ExecQueue {
    pub fn new() -> Self {
        ExecQueue {
            entries: Vec::new(),
        }
    }

    /// Files a world command for execution. `authoritative` is true on the
    /// server, which simply discards epoch-mismatched commands; clients keep
    /// them queued and let the caller decide whether the mismatch is fatal,
    /// since during a resync commands for the next epoch arrive before the
    /// reload completes.
    pub fn enqueue(
        &mut self,
        msg: Message,
        current_step: u32,
        current_epoch: u32,
        authoritative: bool,
    ) -> EnqueueOutcome {
        let Some(stamp) = msg.stamp() else {
            warn!("refusing to queue a plain command of type {}", msg.command.kind());
            return EnqueueOutcome::Stale;
        };
        if stamp.map_counter != current_epoch {
            if authoritative {
                return EnqueueOutcome::WrongEpoch;
            }
            warn!(
                "queueing command for map counter {} while world is at {}",
                stamp.map_counter, current_epoch
            );
            self.insert(msg);
            return EnqueueOutcome::WrongEpoch;
        }
        if stamp.sync_step < current_step && !msg.command.order_insensitive() {
            return EnqueueOutcome::Stale;
        }
        self.insert(msg);
        EnqueueOutcome::Queued
    }

    fn insert(&mut self, msg: Message) {
        let step = msg.stamp().map(|s| s.sync_step).unwrap_or(0);
        let at = self
            .entries
            .partition_point(|e| e.stamp().map(|s| s.sync_step).unwrap_or(0) <= step);
        self.entries.insert(at, msg);
    }

    /// Removes and returns every command due at or before `current_step`,
    /// in execution order. Order-insensitive stragglers queued for past
    /// steps come out here too.
    pub fn drain_due(&mut self, current_step: u32) -> Vec<Message> {
        let upto = self
            .entries
            .partition_point(|e| e.stamp().map(|s| s.sync_step).unwrap_or(0) <= current_step);
        self.entries.drain(..upto).collect()
    }

    /// Earliest pending target step, if any.
    pub fn next_step(&self) -> Option<u32> {
        self.entries.first().and_then(|e| e.stamp()).map(|s| s.sync_step)
    }

    /// Dropped on wholesale state reloads.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
