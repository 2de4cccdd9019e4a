// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Partition dispatchers for row-change events.
//!
//! A dispatcher maps a [`RowChangedEvent`] to a partition index in
//! `[0, partition_count)` so that the sink preserves per-key ordering.
//!
//! Two strategies:
//!
//! - [`TableDispatcher`]: all rows of one table land on one partition.
//! - [`DefaultDispatcher`]: rows are spread by handle-key value, falling
//!   back to table routing when the row does not have exactly one index or
//!   when old-value mode is on (deletes then only carry the pre-image, and
//!   splitting a key's insert and delete across partitions would reorder
//!   them).
//!
//! The hash layout is part of the sink wire contract. Changing it reshuffles
//! every partitioned topic, so the expected partitions are pinned in tests.

use crate::model::RowChangedEvent;

/// Maps row events to sink partitions.
pub trait PartitionDispatcher {
    fn dispatch(&self, row: &RowChangedEvent) -> i32;
}

/// Order-insensitive row hasher.
///
/// Each [`write`](RowHasher::write) call contributes the IEEE CRC32 of its
/// concatenated parts, XOR-folded into the running value. Folding with XOR
/// makes the digest independent of write order, so the same row hashes the
/// same regardless of column iteration order.
#[derive(Debug, Default)]
pub struct RowHasher {
    value: u32,
}

impl RowHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one logical write (the concatenation of `parts`) into the hash.
    pub fn write(&mut self, parts: &[&[u8]]) {
        let mut hasher = crc32fast::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        self.value ^= hasher.finalize();
    }

    pub fn finish(&self) -> u32 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}

/// Routes every row of a table to the same partition.
#[derive(Debug)]
pub struct TableDispatcher {
    partition_num: i32,
}

impl TableDispatcher {
    pub fn new(partition_num: i32) -> Self {
        assert!(partition_num > 0, "partition count must be positive");
        Self { partition_num }
    }
}

impl PartitionDispatcher for TableDispatcher {
    fn dispatch(&self, row: &RowChangedEvent) -> i32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(row.table.schema.as_bytes());
        hasher.update(row.table.table.as_bytes());
        (hasher.finalize() % self.partition_num as u32) as i32
    }
}

/// Routes rows by handle-key value, one partition per key.
#[derive(Debug)]
struct IndexValueDispatcher {
    partition_num: i32,
}

impl IndexValueDispatcher {
    fn dispatch(&self, row: &RowChangedEvent) -> i32 {
        let mut hasher = RowHasher::new();
        hasher.write(&[row.table.schema.as_bytes(), row.table.table.as_bytes()]);

        let columns = if row.columns.is_empty() {
            &row.pre_columns
        } else {
            &row.columns
        };
        for col in columns {
            if col.flags.is_handle_key() {
                hasher.write(&[col.name.as_bytes(), col.value.encode().as_bytes()]);
            }
        }
        (hasher.finish() % self.partition_num as u32) as i32
    }
}

/// The default routing strategy.
///
/// Spreads rows by handle key when the row has exactly one index and
/// old-value mode is off; otherwise routes by table.
#[derive(Debug)]
pub struct DefaultDispatcher {
    table: TableDispatcher,
    index_value: IndexValueDispatcher,
    include_old_value: bool,
}

impl DefaultDispatcher {
    pub fn new(partition_num: i32, include_old_value: bool) -> Self {
        Self {
            table: TableDispatcher::new(partition_num),
            index_value: IndexValueDispatcher { partition_num },
            include_old_value,
        }
    }
}

impl PartitionDispatcher for DefaultDispatcher {
    fn dispatch(&self, row: &RowChangedEvent) -> i32 {
        if self.include_old_value {
            return self.table.dispatch(row);
        }
        if row.index_columns.len() != 1 {
            return self.table.dispatch(row);
        }
        self.index_value.dispatch(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, ColumnFlags, ColumnValue, TableName};

    fn row(table: &str, commit_ts: u64) -> RowChangedEvent {
        RowChangedEvent {
            table: TableName::new("test", table),
            commit_ts,
            columns: Vec::new(),
            pre_columns: Vec::new(),
            index_columns: Vec::new(),
        }
    }

    fn pk(name: &str, value: i64) -> Column {
        Column::new(
            name,
            ColumnValue::Int(value),
            ColumnFlags::HANDLE_KEY.union(ColumnFlags::PRIMARY_KEY),
        )
    }

    #[test]
    fn test_table_dispatcher() {
        let p = TableDispatcher::new(16);
        for (table, commit_ts, expected) in [
            ("t1", 1, 15),
            ("t1", 2, 15),
            ("t1", 3, 15),
            ("t2", 1, 5),
            ("t2", 2, 5),
            ("t2", 3, 5),
            ("t3", 3, 3),
        ] {
            assert_eq!(p.dispatch(&row(table, commit_ts)), expected, "test.{table}");
        }
    }

    #[test]
    fn test_default_dispatcher_single_pk() {
        let p = DefaultDispatcher::new(16, false);
        for (value, expected) in [(1, 11), (2, 1), (3, 7)] {
            let mut r = row("t1", 1);
            r.columns = vec![pk("id", value)];
            r.index_columns = vec![vec![0]];
            assert_eq!(p.dispatch(&r), expected, "test.t1 pk={value}");
        }
    }

    #[test]
    fn test_default_dispatcher_ignores_non_key_columns() {
        let p = DefaultDispatcher::new(16, false);
        for (id, a, expected) in [(1, 1, 1), (2, 2, 11), (3, 3, 13), (3, 4, 13)] {
            let mut r = row("t2", 1);
            r.columns = vec![
                pk("id", id),
                Column::new("a", ColumnValue::Int(a), ColumnFlags::NONE),
            ];
            r.index_columns = vec![vec![0]];
            assert_eq!(p.dispatch(&r), expected, "test.t2 pk={id} a={a}");
        }
    }

    #[test]
    fn test_default_dispatcher_composite_unique_routes_by_table() {
        let p = DefaultDispatcher::new(16, false);
        for (id, a) in [(1, 2), (2, 3), (3, 4)] {
            let mut r = row("t3", 1);
            r.columns = vec![
                pk("id", id),
                Column::new("a", ColumnValue::Int(a), ColumnFlags::UNIQUE_KEY),
            ];
            r.index_columns = vec![vec![0], vec![1]];
            assert_eq!(p.dispatch(&r), 3, "test.t3 pk={id} uniq={a}");
        }
    }

    #[test]
    fn test_default_dispatcher_old_value_routes_by_table() {
        let p = DefaultDispatcher::new(16, true);
        let mut r = row("t3", 1);
        r.columns = vec![
            pk("id", 2),
            Column::new("a", ColumnValue::Int(3), ColumnFlags::UNIQUE_KEY),
        ];
        r.index_columns = vec![vec![0], vec![1]];
        assert_eq!(p.dispatch(&r), 3);
    }

    #[test]
    fn test_index_value_uses_pre_columns_for_deletes() {
        let p = DefaultDispatcher::new(16, false);
        let mut insert = row("t1", 1);
        insert.columns = vec![pk("id", 1)];
        insert.index_columns = vec![vec![0]];

        let mut delete = row("t1", 2);
        delete.pre_columns = vec![pk("id", 1)];
        delete.index_columns = vec![vec![0]];

        assert_eq!(p.dispatch(&insert), p.dispatch(&delete));
    }

    #[test]
    fn test_row_hasher_order_insensitive() {
        let mut a = RowHasher::new();
        a.write(&[b"test", b"t1"]);
        a.write(&[b"id", b"1"]);

        let mut b = RowHasher::new();
        b.write(&[b"id", b"1"]);
        b.write(&[b"test", b"t1"]);

        assert_eq!(a.finish(), b.finish());

        a.reset();
        assert_eq!(a.finish(), 0);
    }

    #[test]
    fn test_dispatch_in_range() {
        let p = DefaultDispatcher::new(7, false);
        for i in 0..50 {
            let mut r = row("t1", 1);
            r.columns = vec![pk("id", i)];
            r.index_columns = vec![vec![0]];
            let partition = p.dispatch(&r);
            assert!((0..7).contains(&partition));
        }
    }
}
