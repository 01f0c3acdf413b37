//! Lightweight rolling summary of simulation state, exchanged between
//! participants to detect divergence without shipping whole snapshots.

use crate::packet::Packet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// State fingerprint at one sync step. Two participants holding identical
/// simulation state must produce byte-identical checklists at the same step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checklist {
    /// Position of the deterministic RNG stream.
    pub random_seed: u32,
    /// Number of live world objects.
    pub object_count: u32,
    /// Bitmask of active players/companies.
    pub player_mask: u16,
    /// Rolling hash over the world contents.
    pub state_hash: u32,
}

impl Checklist {
    pub fn rdwr_put(&self, pkt: &mut Packet) {
        pkt.put_u32(self.random_seed);
        pkt.put_u32(self.object_count);
        pkt.put_u16(self.player_mask);
        pkt.put_u32(self.state_hash);
    }

    pub fn rdwr_get(pkt: &mut Packet) -> Checklist {
        Checklist {
            random_seed: pkt.get_u32(),
            object_count: pkt.get_u32(),
            player_mask: pkt.get_u16(),
            state_hash: pkt.get_u32(),
        }
    }
}

/// Bounded ring of recent per-step checklists. Both sides keep one: the
/// server to stamp outgoing commands with a fingerprint at a known step, the
/// client to compare an incoming fingerprint against what it computed when
/// it was at that step itself.
#[derive(Debug, Clone, Default)]
pub struct ChecklistHistory {
    entries: VecDeque<(u32, Checklist)>,
}

impl ChecklistHistory {
    /// Steps kept before the oldest entries roll off.
    pub const CAPACITY: usize = 64;

    pub fn new() -> Self {
        ChecklistHistory {
            entries: VecDeque::with_capacity(Self::CAPACITY),
        }
    }

    /// Records the checklist computed at `step`, evicting the oldest entry
    /// once full. Re-recording the same step overwrites.
    pub fn record(&mut self, step: u32, checklist: Checklist) {
        if let Some(entry) = self.entries.iter_mut().find(|(s, _)| *s == step) {
            entry.1 = checklist;
            return;
        }
        if self.entries.len() == Self::CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back((step, checklist));
    }

    pub fn get(&self, step: u32) -> Option<Checklist> {
        self.entries
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, ck)| *ck)
    }

    /// Most recent recorded entry, for stamping outgoing commands.
    pub fn latest(&self) -> Option<(u32, Checklist)> {
        self.entries.back().copied()
    }

    /// Drops everything; called on wholesale state reloads where old steps
    /// no longer describe the current world.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Display for Checklist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[rand={} objects={} players={:#06x} hash={:#010x}]",
            self.random_seed, self.object_count, self.player_mask, self.state_hash
        )
    }
}
