// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dump-manifest parsing.
//!
//! A full-dump task leaves a `metadata` file in its output directory in the
//! well-known mydumper textual format. The first `SHOW MASTER STATUS`
//! section is the position the dump started at; a second section (written
//! after the dump's connection pool was established, for consistency modes
//! that cannot pin a single snapshot) marks where idempotent safe mode may
//! end.
//!
//! Parse failures embed the full file contents in the error: these files
//! are small, written by another tool, and the first question is always
//! "what was actually in it".

use crate::error::{EngineError, Result};
use crate::location::Location;
use std::path::Path;

/// Positions recovered from a dump manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpMeta {
    /// Where incremental replication resumes.
    pub location: Location,
    /// Where safe mode may end, when the dump recorded one.
    pub safe_mode_exit_location: Option<Location>,
}

/// Read and parse `<dir>/metadata`.
pub fn parse_meta_data(dir: &str) -> Result<DumpMeta> {
    let path = Path::new(dir).join("metadata");
    let contents = std::fs::read_to_string(&path).map_err(|e| EngineError::MetaParse {
        reason: format!("cannot read {}: {e}", path.display()),
        contents: String::new(),
    })?;
    parse_meta_contents(&contents)
}

fn parse_meta_contents(contents: &str) -> Result<DumpMeta> {
    #[derive(Default)]
    struct Section {
        log: Option<String>,
        pos: Option<u32>,
        gtid: Option<String>,
    }

    impl Section {
        fn to_location(&self) -> Option<Location> {
            let file = self.log.clone()?;
            Some(Location {
                file,
                pos: self.pos.unwrap_or(0),
                gtid_set: self.gtid.clone().filter(|g| !g.is_empty()),
                suffix: 0,
            })
        }
    }

    let mut first = Section::default();
    let mut second = Section::default();
    // 0 = outside, 1 = first master-status block, 2 = pool-established block,
    // 3 = a block we ignore (e.g. SHOW SLAVE STATUS)
    let mut current = 0u8;

    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with("SHOW MASTER STATUS") {
            current = if line.contains("AFTER CONNECTION POOL ESTABLISHED") {
                2
            } else {
                1
            };
            continue;
        }
        if line.starts_with("SHOW SLAVE STATUS") || line.starts_with("Finished dump at") {
            current = 3;
            continue;
        }
        let section = match current {
            1 => &mut first,
            2 => &mut second,
            _ => continue,
        };
        if let Some(value) = line.strip_prefix("Log:") {
            section.log = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Pos:") {
            section.pos = value.trim().parse::<u32>().ok();
        } else if let Some(value) = line.strip_prefix("GTID:") {
            section.gtid = Some(value.trim().to_string());
        }
    }

    let location = first.to_location().ok_or_else(|| EngineError::MetaParse {
        reason: "no master status position found".to_string(),
        contents: contents.to_string(),
    })?;

    Ok(DumpMeta {
        location,
        safe_mode_exit_location: second.to_location(),
    })
}
