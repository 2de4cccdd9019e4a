// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Binlog watermark locations.
//!
//! A [`Location`] names a position in the upstream binlog stream: file name,
//! byte offset, and an optional GTID set. Two orderings exist over
//! locations:
//!
//! - **Position order**: lexicographic over `(file, pos, suffix)`. Used when
//!   replication runs in position mode.
//! - **GTID-aware order**: compares the GTID sets when both sides carry one
//!   and they differ, falling back to position order otherwise.
//!
//! All comparisons go through [`compare_locations`]. Nothing else in the
//! crate compares locations field-by-field; the checkpoint invariants only
//! hold if every caller agrees on one order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A position in the upstream binlog stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Binlog file name, e.g. `"mysql-bin.000003"`. Empty means fresh.
    pub file: String,
    /// Byte offset within the file.
    pub pos: u32,
    /// Normalized GTID set text, when GTID mode is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_set: Option<String>,
    /// Re-sync counter. Incremented when the stream restarts mid-transaction
    /// and reset to zero on rollback.
    #[serde(default)]
    pub suffix: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, pos: u32) -> Self {
        Self {
            file: file.into(),
            pos,
            gtid_set: None,
            suffix: 0,
        }
    }

    pub fn with_gtid(file: impl Into<String>, pos: u32, gtid_set: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            pos,
            gtid_set: Some(gtid_set.into()),
            suffix: 0,
        }
    }

    /// The zero location: no file, offset zero, no GTID set.
    pub fn fresh() -> Self {
        Self::default()
    }

    /// True iff this location has never been advanced.
    pub fn is_fresh(&self) -> bool {
        self.file.is_empty()
            && self.pos == 0
            && self.gtid_set.as_deref().map_or(true, str::is_empty)
    }

    /// Reset the re-sync suffix to zero.
    pub fn reset_suffix(&mut self) {
        self.suffix = 0;
    }

    fn position_key(&self) -> (&str, u32, u32) {
        (&self.file, self.pos, self.suffix)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.gtid_set {
            Some(gtid) => write!(f, "({}, {}, {})", self.file, self.pos, gtid),
            None => write!(f, "({}, {})", self.file, self.pos),
        }
    }
}

/// Compare two locations under the active order.
///
/// With `gtid_aware` set, differing GTID sets decide the order; equal or
/// missing sets fall back to position order. Without it, only
/// `(file, pos, suffix)` matter.
pub fn compare_locations(a: &Location, b: &Location, gtid_aware: bool) -> Ordering {
    if gtid_aware {
        if let (Some(ga), Some(gb)) = (&a.gtid_set, &b.gtid_set) {
            if !ga.is_empty() && !gb.is_empty() && ga != gb {
                return ga.cmp(gb);
            }
        }
    }
    a.position_key().cmp(&b.position_key())
}
