// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared identifiers and the row-event model.
//!
//! These types cross subsystem boundaries: the scheduler keys operations by
//! [`TableId`], the checkpoint engine persists [`TableInfo`] snapshots, and
//! the partition dispatchers consume [`RowChangedEvent`]s.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical table identifier assigned by the upstream cluster.
pub type TableId = i64;

/// A timestamp in the upstream cluster's logical clock domain.
pub type Ts = u64;

/// Identifier of a capture (worker process).
pub type CaptureId = String;

/// Identifier of a storage actor shard.
pub type ActorId = u64;

/// Qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// A column definition inside a [`TableInfo`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// SQL type text, e.g. `"int(11)"`.
    pub field_type: String,
}

/// A schema snapshot for one table at a binlog position.
///
/// Snapshots are persisted to the checkpoint table's `table_info` JSON
/// column and restored on load. Identity matters: applying a DDL produces a
/// *new* snapshot allocation, so rollback compares snapshots by `Arc`
/// pointer rather than by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: i64,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub pk_is_handle: bool,
}

impl TableInfo {
    /// Minimal snapshot for tests and standalone use.
    pub fn mock(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            columns: vec![ColumnInfo {
                name: "id".to_string(),
                field_type: "bigint(20)".to_string(),
            }],
            pk_is_handle: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row-event model consumed by the partition dispatchers
// ═══════════════════════════════════════════════════════════════════════════════

/// Column flags carried on row-change events.
///
/// A newtype over a bit set; only the bits the dispatchers care about are
/// defined here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnFlags(u64);

impl ColumnFlags {
    pub const NONE: ColumnFlags = ColumnFlags(0);
    /// The column is part of the handle key (row identity).
    pub const HANDLE_KEY: ColumnFlags = ColumnFlags(1 << 0);
    pub const PRIMARY_KEY: ColumnFlags = ColumnFlags(1 << 1);
    pub const UNIQUE_KEY: ColumnFlags = ColumnFlags(1 << 2);

    pub fn union(self, other: ColumnFlags) -> ColumnFlags {
        ColumnFlags(self.0 | other.0)
    }

    pub fn is_handle_key(self) -> bool {
        self.0 & Self::HANDLE_KEY.0 != 0
    }

    pub fn is_unique_key(self) -> bool {
        self.0 & Self::UNIQUE_KEY.0 != 0
    }
}

/// A column value on a row-change event.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl ColumnValue {
    /// Canonical text encoding used for partition hashing.
    ///
    /// Must stay stable across releases: changing it re-shuffles every
    /// partitioned sink.
    pub fn encode(&self) -> String {
        match self {
            ColumnValue::Null => "null".to_string(),
            ColumnValue::Bool(true) => "1".to_string(),
            ColumnValue::Bool(false) => "0".to_string(),
            ColumnValue::Int(v) => v.to_string(),
            ColumnValue::Uint(v) => v.to_string(),
            ColumnValue::Float(v) => v.to_string(),
            ColumnValue::String(v) => v.clone(),
            ColumnValue::Bytes(v) => String::from_utf8_lossy(v).into_owned(),
        }
    }
}

/// One column of a row-change event.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
    pub flags: ColumnFlags,
}

impl Column {
    pub fn new(name: impl Into<String>, value: ColumnValue, flags: ColumnFlags) -> Self {
        Self {
            name: name.into(),
            value,
            flags,
        }
    }
}

/// A row-level change event headed for a downstream sink.
#[derive(Debug, Clone)]
pub struct RowChangedEvent {
    pub table: TableName,
    pub commit_ts: Ts,
    /// Post-image columns; empty for deletes when only the pre-image is
    /// available.
    pub columns: Vec<Column>,
    /// Pre-image columns, populated in old-value mode.
    pub pre_columns: Vec<Column>,
    /// Offsets into `columns` for each index on the table; the first entry
    /// is the handle index.
    pub index_columns: Vec<Vec<usize>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_display() {
        let t = TableName::new("test", "t1");
        assert_eq!(t.to_string(), "test.t1");
    }

    #[test]
    fn test_column_flags() {
        let f = ColumnFlags::HANDLE_KEY.union(ColumnFlags::PRIMARY_KEY);
        assert!(f.is_handle_key());
        assert!(!f.is_unique_key());
        assert!(!ColumnFlags::NONE.is_handle_key());
    }

    #[test]
    fn test_column_value_encoding() {
        assert_eq!(ColumnValue::Null.encode(), "null");
        assert_eq!(ColumnValue::Bool(true).encode(), "1");
        assert_eq!(ColumnValue::Bool(false).encode(), "0");
        assert_eq!(ColumnValue::Int(-42).encode(), "-42");
        assert_eq!(ColumnValue::Uint(7).encode(), "7");
        assert_eq!(ColumnValue::String("abc".into()).encode(), "abc");
        assert_eq!(ColumnValue::Bytes(b"xyz".to_vec()).encode(), "xyz");
    }

    #[test]
    fn test_table_info_json_roundtrip() {
        let ti = TableInfo::mock(11, "t1");
        let json = serde_json::to_string(&ti).unwrap();
        let back: TableInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(ti, back);
    }
}
