//! Pakset fingerprint comparison: before joining, a client walks the
//! server's table of installed content-addon checksums one named item at a
//! time (init → want-next → data | done) and builds a human-readable
//! mismatch report.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const CHECKSUM_LEN: usize = 20;

/// Exchange phases of the cursor protocol.
pub const PAK_INIT: u8 = 0;
pub const PAK_WANT_NEXT: u8 = 1;
pub const PAK_DATA: u8 = 2;
pub const PAK_DONE: u8 = 3;

/// One installed content addon: name plus content checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PakEntry {
    pub name: String,
    pub checksum: [u8; CHECKSUM_LEN],
}

/// Name-sorted fingerprint table. Sorted order is what makes the stateless
/// want-next cursor work: the client echoes the last name it saw and the
/// server answers with the first entry strictly after it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PakTable {
    entries: Vec<PakEntry>,
}

impl PakTable {
    pub fn new() -> Self {
        PakTable::default()
    }

    pub fn insert(&mut self, name: &str, checksum: [u8; CHECKSUM_LEN]) {
        let entry = PakEntry {
            name: name.to_string(),
            checksum,
        };
        match self.entries.binary_search_by(|e| e.name.as_str().cmp(name)) {
            Ok(at) => self.entries[at] = entry,
            Err(at) => self.entries.insert(at, entry),
        }
    }

    pub fn first(&self) -> Option<&PakEntry> {
        self.entries.first()
    }

    /// First entry with a name strictly greater than `name`.
    pub fn next_after(&self, name: &str) -> Option<&PakEntry> {
        let at = self
            .entries
            .partition_point(|e| e.name.as_str() <= name);
        self.entries.get(at)
    }

    pub fn find(&self, name: &str) -> Option<&PakEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|at| &self.entries[at])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PakEntry> {
        self.entries.iter()
    }
}

/// Accumulates the comparison as server entries stream in, then reports
/// what differs, what the client lacks and what only the client has.
#[derive(Debug)]
pub struct PakCompare<'a> {
    local: &'a PakTable,
    seen: Vec<String>,
    missing_locally: Vec<String>,
    differing: Vec<String>,
}

impl<'a> PakCompare<'a> {
    pub fn new(local: &'a PakTable) -> Self {
        PakCompare {
            local,
            seen: Vec::new(),
            missing_locally: Vec::new(),
            differing: Vec::new(),
        }
    }

    /// Feeds one entry received from the server.
    pub fn offer(&mut self, name: &str, checksum: &[u8]) {
        self.seen.push(name.to_string());
        match self.local.find(name) {
            None => self.missing_locally.push(name.to_string()),
            Some(entry) if entry.checksum != checksum => self.differing.push(name.to_string()),
            Some(_) => {}
        }
    }

    /// Closes the exchange and produces the report.
    pub fn finish(self) -> PakReport {
        let extra_locally = self
            .local
            .iter()
            .filter(|e| !self.seen.contains(&e.name))
            .map(|e| e.name.clone())
            .collect();
        PakReport {
            missing_locally: self.missing_locally,
            differing: self.differing,
            extra_locally,
        }
    }
}

/// Human-readable mismatch summary shown before a join attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PakReport {
    pub missing_locally: Vec<String>,
    pub differing: Vec<String>,
    pub extra_locally: Vec<String>,
}

impl PakReport {
    pub fn matches(&self) -> bool {
        self.missing_locally.is_empty() && self.differing.is_empty() && self.extra_locally.is_empty()
    }
}

impl fmt::Display for PakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.matches() {
            return write!(f, "pakset matches the server");
        }
        if !self.missing_locally.is_empty() {
            writeln!(f, "missing locally: {}", self.missing_locally.join(", "))?;
        }
        if !self.differing.is_empty() {
            writeln!(f, "checksum differs: {}", self.differing.join(", "))?;
        }
        if !self.extra_locally.is_empty() {
            writeln!(f, "only installed locally: {}", self.extra_locally.join(", "))?;
        }
        Ok(())
    }
}
