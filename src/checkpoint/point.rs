// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Saved/flushed point pairs.
//!
//! Every checkpoint entry is a pair of [`TablePoint`]s: `saved` moves in
//! memory as the stream advances, `flushed` only moves when a durable write
//! confirms. The invariant `flushed <= saved` (under the active order) holds
//! at all times; `save` rejects regressions and `rollback` collapses the
//! pair back onto `flushed`.

use crate::error::{EngineError, Result};
use crate::location::{compare_locations, Location};
use crate::model::{TableInfo, TableName};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// A location plus the table schema in force at that location.
#[derive(Debug, Clone, Default)]
pub struct TablePoint {
    pub location: Location,
    pub table_info: Option<Arc<TableInfo>>,
}

impl TablePoint {
    pub fn new(location: Location, table_info: Option<Arc<TableInfo>>) -> Self {
        Self {
            location,
            table_info,
        }
    }
}

impl fmt::Display for TablePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table_info {
            Some(ti) => write!(
                f,
                "location({}), table({}, {} columns)",
                self.location,
                ti.name,
                ti.columns.len()
            ),
            None => write!(f, "location({})", self.location),
        }
    }
}

/// Schema snapshots are compared by identity: a DDL application allocates a
/// new snapshot, so pointer equality is exactly "no schema change since".
fn same_table_info(a: &Option<Arc<TableInfo>>, b: &Option<Arc<TableInfo>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// The schema-restoration interface consumed by rollback.
///
/// The tracker mirrors upstream schemas in memory; after a failed flush the
/// checkpoint engine resets it to the last durably flushed schema.
pub trait SchemaTracker {
    fn get_table(&self, table: &TableName) -> Option<Arc<TableInfo>>;
    fn drop_table(&self, table: &TableName) -> Result<()>;
    fn create_schema_if_not_exists(&self, schema: &str) -> Result<()>;
    fn batch_create_table_if_not_exist(
        &self,
        tables: &HashMap<String, HashMap<String, Arc<TableInfo>>>,
    ) -> Result<()>;
    /// Every table currently tracked.
    fn all_tables(&self) -> Vec<TableName>;
}

/// In-memory [`SchemaTracker`] for tests and standalone use.
#[derive(Default)]
pub struct MemSchemaTracker {
    tables: std::sync::Mutex<HashMap<String, HashMap<String, Arc<TableInfo>>>>,
}

impl MemSchemaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, table: &TableName, ti: Arc<TableInfo>) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.schema.clone())
            .or_default()
            .insert(table.table.clone(), ti);
    }
}

impl SchemaTracker for MemSchemaTracker {
    fn get_table(&self, table: &TableName) -> Option<Arc<TableInfo>> {
        self.tables
            .lock()
            .unwrap()
            .get(&table.schema)
            .and_then(|m| m.get(&table.table))
            .cloned()
    }

    fn drop_table(&self, table: &TableName) -> Result<()> {
        if let Some(m) = self.tables.lock().unwrap().get_mut(&table.schema) {
            m.remove(&table.table);
        }
        Ok(())
    }

    fn create_schema_if_not_exists(&self, schema: &str) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .entry(schema.to_string())
            .or_default();
        Ok(())
    }

    fn batch_create_table_if_not_exist(
        &self,
        tables: &HashMap<String, HashMap<String, Arc<TableInfo>>>,
    ) -> Result<()> {
        let mut all = self.tables.lock().unwrap();
        for (schema, m) in tables {
            let entry = all.entry(schema.clone()).or_default();
            for (table, ti) in m {
                entry.entry(table.clone()).or_insert_with(|| Arc::clone(ti));
            }
        }
        Ok(())
    }

    fn all_tables(&self) -> Vec<TableName> {
        self.tables
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(schema, m)| {
                m.keys()
                    .map(|t| TableName::new(schema.clone(), t.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

struct PointPair {
    saved: TablePoint,
    flushed: TablePoint,
}

/// One checkpoint entry: a saved/flushed pair behind its own lock.
///
/// Entries are shared (`Arc`) between the map that indexes them and
/// snapshots that reference them, so each carries its own lock rather than
/// relying on the map's.
pub struct BinlogPoint {
    inner: RwLock<PointPair>,
    enable_gtid: bool,
}

impl BinlogPoint {
    pub fn new(
        saved: TablePoint,
        flushed: TablePoint,
        enable_gtid: bool,
    ) -> Self {
        Self {
            inner: RwLock::new(PointPair { saved, flushed }),
            enable_gtid,
        }
    }

    /// Advance the saved point. Saving an equal location is allowed; an
    /// older one is rejected.
    pub fn save(&self, location: Location, table_info: Option<Arc<TableInfo>>) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if compare_locations(&location, &inner.saved.location, self.enable_gtid) == Ordering::Less {
            return Err(EngineError::NonMonotonicSave {
                incoming: location.to_string(),
                saved: inner.saved.location.to_string(),
            });
        }
        inner.saved.location = location;
        inner.saved.table_info = table_info;
        Ok(())
    }

    /// Mark the current saved point as durably flushed.
    pub fn flush(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.flushed = inner.saved.clone();
    }

    /// Mark the given point as durably flushed.
    pub fn flush_by(&self, point: TablePoint) {
        let mut inner = self.inner.write().unwrap();
        inner.flushed = point;
    }

    /// Collapse the saved point back onto the flushed point, resetting the
    /// re-sync suffix. Returns whether the schema snapshot changed relative
    /// to the tracker (by identity), in which case the caller restores the
    /// tracker from the flushed schema.
    pub fn rollback(&self, tracker: &dyn SchemaTracker, schema: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        inner.flushed.location.reset_suffix();
        inner.saved.location = inner.flushed.location.clone();
        let Some(saved_ti) = inner.saved.table_info.clone() else {
            // the global entry carries no schema
            return false;
        };
        let tracked = tracker.get_table(&TableName::new(schema, saved_ti.name.clone()));
        let schema_changed = !same_table_info(&tracked, &inner.saved.table_info)
            || !same_table_info(&inner.saved.table_info, &inner.flushed.table_info);
        if schema_changed {
            inner.saved.table_info = inner.flushed.table_info.clone();
        }
        schema_changed
    }

    /// Replace both points, e.g. when (re)loading from storage.
    pub fn reset_to(&self, location: Location, table_info: Option<Arc<TableInfo>>) {
        let mut inner = self.inner.write().unwrap();
        inner.saved = TablePoint::new(location.clone(), table_info.clone());
        inner.flushed = TablePoint::new(location, table_info);
    }

    /// Whether the saved point has moved past the flushed point.
    pub fn out_of_date(&self) -> bool {
        let inner = self.inner.read().unwrap();
        compare_locations(
            &inner.saved.location,
            &inner.flushed.location,
            self.enable_gtid,
        ) == Ordering::Greater
    }

    /// Whether `location` is ahead of the flushed point.
    pub fn out_of_date_by(&self, location: &Location) -> bool {
        let inner = self.inner.read().unwrap();
        compare_locations(location, &inner.flushed.location, self.enable_gtid)
            == Ordering::Greater
    }

    pub fn location(&self) -> Location {
        self.inner.read().unwrap().saved.location.clone()
    }

    pub fn flushed_location(&self) -> Location {
        self.inner.read().unwrap().flushed.location.clone()
    }

    pub fn saved_point(&self) -> TablePoint {
        self.inner.read().unwrap().saved.clone()
    }

    pub fn table_info(&self) -> Option<Arc<TableInfo>> {
        self.inner.read().unwrap().saved.table_info.clone()
    }

    pub fn flushed_table_info(&self) -> Option<Arc<TableInfo>> {
        self.inner.read().unwrap().flushed.table_info.clone()
    }
}

impl fmt::Display for BinlogPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap();
        write!(f, "{}(flushed {})", inner.saved, inner.flushed)
    }
}
