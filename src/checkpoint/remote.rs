// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The checkpoint engine.
//!
//! Tracks one global watermark plus one watermark per replicated table,
//! each as a saved/flushed pair (see [`super::point`]). Durable flushes are
//! snapshot-based: [`RemoteCheckpoint::snapshot`] freezes every entry whose
//! saved point moved past its flushed point, and a later
//! [`RemoteCheckpoint::flush_points_except`] persists exactly that frozen
//! state, so saves racing with a flush can never smear a half-advanced
//! state into the store.
//!
//! # Invariants
//!
//! - Saved locations never regress; a stale save is rejected and logged.
//! - The global saved point never overtakes any table's saved point.
//!   A table save behind the global point is a caller bug and panics.
//! - Snapshots carry strictly-increasing ids and are flushed FIFO;
//!   flushing out of order panics.
//!
//! # Locking
//!
//! The entry maps sit behind one `RwLock`; each entry carries its own lock
//! (entries are shared with snapshots). The snapshot queue and sequence sit
//! behind a `Mutex`. No lock is held across database I/O: flush builds its
//! statement batch under the lock, releases it, then executes under the
//! flush deadline (detached from the caller's cancellation, so shutting
//! down an agent cannot tear a durable write in half).

use crate::config::{CheckpointConfig, TaskMode};
use crate::error::{EngineError, Result};
use crate::location::{compare_locations, Location};
use crate::metrics;
use crate::model::{TableInfo, TableName};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::db::{CheckpointDb, SqlParam};
use super::meta::parse_meta_data;
use super::point::{BinlogPoint, SchemaTracker, TablePoint};

/// Upserts per statement batch in [`RemoteCheckpoint::flush_points_with_table_infos`].
const BATCH_FLUSH_POINTS: usize = 100;

/// Identity of a snapshot handed back to the flush scheduler.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub id: u64,
    /// Global saved position at snapshot time, for relay-log housekeeping.
    pub global_pos: Location,
}

struct Snapshot {
    id: u64,
    global_point: Option<TablePoint>,
    global_point_save_time: Option<Instant>,
    /// schema → table → frozen point, only entries with `saved > flushed`.
    points: HashMap<String, HashMap<String, TablePoint>>,
}

#[derive(Default)]
struct SnapshotQueue {
    snapshots: Vec<Snapshot>,
    seq: u64,
}

/// Checkpoint engine persisting to a relational target through `D`.
pub struct RemoteCheckpoint<D> {
    db: D,
    cfg: CheckpointConfig,
    /// Checkpoint id; rows for several sources can share one table.
    id: String,
    table_name: String,

    /// source-schema → source-table → entry.
    points: RwLock<HashMap<String, HashMap<String, Arc<BinlogPoint>>>>,
    global_point: BinlogPoint,

    global_point_save_time: RwLock<Option<Instant>>,
    last_snapshot_creation_time: RwLock<Option<Instant>>,

    safe_mode_exit_point: RwLock<Option<Location>>,
    need_flush_safe_mode_exit_point: AtomicBool,

    snapshots: Mutex<SnapshotQueue>,
}

impl<D: CheckpointDb> RemoteCheckpoint<D> {
    pub fn new(db: D, cfg: CheckpointConfig, id: impl Into<String>) -> Self {
        let table_name = cfg.table_name();
        let enable_gtid = cfg.enable_gtid;
        Self {
            db,
            cfg,
            id: id.into(),
            table_name,
            points: RwLock::new(HashMap::new()),
            global_point: BinlogPoint::new(
                TablePoint::default(),
                TablePoint::default(),
                enable_gtid,
            ),
            global_point_save_time: RwLock::new(None),
            last_snapshot_creation_time: RwLock::new(None),
            safe_mode_exit_point: RwLock::new(None),
            need_flush_safe_mode_exit_point: AtomicBool::new(false),
            snapshots: Mutex::new(SnapshotQueue::default()),
        }
    }

    /// Create the checkpoint schema and table on the target.
    pub async fn init(&self) -> Result<()> {
        let create_schema = format!("CREATE SCHEMA IF NOT EXISTS `{}`", self.cfg.meta_schema);
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id VARCHAR(32) NOT NULL,
                cp_schema VARCHAR(128) NOT NULL,
                cp_table VARCHAR(128) NOT NULL,
                binlog_name VARCHAR(128),
                binlog_pos INT UNSIGNED,
                binlog_gtid TEXT,
                exit_safe_binlog_name VARCHAR(128) DEFAULT '',
                exit_safe_binlog_pos INT UNSIGNED DEFAULT 0,
                exit_safe_binlog_gtid TEXT,
                table_info JSON NOT NULL,
                is_global BOOLEAN,
                create_time timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP,
                update_time timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
                UNIQUE KEY uk_id_schema_table (id, cp_schema, cp_table)
            )",
            self.table_name
        );
        info!(table = %self.table_name, "creating checkpoint table");
        self.db
            .execute(vec![create_schema, create_table], vec![vec![], vec![]])
            .await
    }

    pub async fn close(&self) {
        if let Err(e) = self.db.close().await {
            warn!(error = %e, "failed to close checkpoint store");
        }
    }

    /// Delete every persisted row for this id and reset in-memory state to
    /// fresh.
    pub async fn clear(&self) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?", self.table_name);
        self.run_with_deadline(vec![sql], vec![vec![SqlParam::Str(self.id.clone())]])
            .await?;

        self.points.write().unwrap().clear();
        self.global_point.reset_to(Location::fresh(), None);
        *self.global_point_save_time.write().unwrap() = None;
        *self.last_snapshot_creation_time.write().unwrap() = None;
        *self.safe_mode_exit_point.write().unwrap() = None;
        self.need_flush_safe_mode_exit_point
            .store(false, AtomicOrdering::SeqCst);
        let mut queue = self.snapshots.lock().unwrap();
        queue.snapshots.clear();
        Ok(())
    }

    /// Rebuild in-memory state from the persisted rows.
    pub async fn load(&self) -> Result<()> {
        let rows = self.db.query_rows(self.id.clone()).await?;
        let mut points = self.points.write().unwrap();
        for row in rows {
            let location = Location {
                file: row.binlog_name.clone(),
                pos: row.binlog_pos,
                gtid_set: row.binlog_gtid.clone().filter(|g| !g.is_empty()),
                suffix: 0,
            };
            if row.is_global {
                // An all-fresh global row must not pin the engine to the
                // zero position; leave it fresh so meta can seed it.
                if !location.is_fresh() {
                    self.global_point.reset_to(location, None);
                    info!(global = %self.global_point, "fetched global checkpoint from store");
                }
                let exit_loc = if self.cfg.enable_gtid {
                    row.exit_safe_binlog_gtid
                        .clone()
                        .filter(|g| !g.is_empty())
                        .map(|gtid| Location {
                            file: row.exit_safe_binlog_name.clone(),
                            pos: row.exit_safe_binlog_pos,
                            gtid_set: Some(gtid),
                            suffix: 0,
                        })
                } else if !row.exit_safe_binlog_name.is_empty() {
                    Some(Location {
                        file: row.exit_safe_binlog_name.clone(),
                        pos: row.exit_safe_binlog_pos,
                        gtid_set: None,
                        suffix: 0,
                    })
                } else {
                    None
                };
                if let Some(loc) = exit_loc {
                    self.set_safe_mode_exit_point(Some(loc));
                }
                continue;
            }

            let table_info = if row.table_info.is_empty() || row.table_info == "null" {
                None
            } else {
                let ti: TableInfo = serde_json::from_str(&row.table_info).map_err(|e| {
                    EngineError::CheckpointStore(format!(
                        "invalid table_info JSON for {}.{}: {e}",
                        row.cp_schema, row.cp_table
                    ))
                })?;
                Some(Arc::new(ti))
            };
            points.entry(row.cp_schema.clone()).or_default().insert(
                row.cp_table.clone(),
                Arc::new(BinlogPoint::new(
                    TablePoint::new(location.clone(), table_info.clone()),
                    TablePoint::new(location, table_info),
                    self.cfg.enable_gtid,
                )),
            );
        }
        Ok(())
    }

    /// Seed the global point from the dump manifest or the configured start
    /// position, depending on the task mode.
    pub fn load_meta(&self) -> Result<()> {
        let (location, safe_mode_exit) = match self.cfg.mode {
            TaskMode::All => {
                let meta = parse_meta_data(&self.cfg.dir)?;
                (Some(meta.location), meta.safe_mode_exit_location)
            }
            TaskMode::Incremental => match &self.cfg.meta {
                Some(meta) => (Some(meta.to_location()), None),
                None => {
                    warn!("no start meta configured for incremental mode, starting fresh");
                    self.global_point.reset_to(Location::fresh(), None);
                    return Ok(());
                }
            },
            TaskMode::Dump => {
                return Err(EngineError::InvalidTaskMode("dump".to_string()));
            }
        };

        if let Some(location) = location {
            self.global_point.reset_to(location, None);
            info!(global = %self.global_point, "loaded checkpoint from meta");
        }
        if safe_mode_exit.is_some() {
            self.set_safe_mode_exit_point(safe_mode_exit);
        }
        Ok(())
    }

    /// Save a table's checkpoint in memory.
    ///
    /// Panics if the location is behind the global saved point: the caller
    /// dispatched an event the global watermark already passed, which means
    /// ordering is broken upstream of us.
    pub fn save_table_point(
        &self,
        table: &TableName,
        location: Location,
        table_info: Option<Arc<TableInfo>>,
    ) {
        let mut points = self.points.write().unwrap();
        self.save_table_point_locked(&mut points, table, location, table_info);
    }

    fn save_table_point_locked(
        &self,
        points: &mut HashMap<String, HashMap<String, Arc<BinlogPoint>>>,
        table: &TableName,
        location: Location,
        table_info: Option<Arc<TableInfo>>,
    ) {
        let global = self.global_point.location();
        if compare_locations(&global, &location, self.cfg.enable_gtid) == Ordering::Greater {
            panic!("table checkpoint {location} less than global checkpoint {global}");
        }

        debug!(table = %table, location = %location, "save table checkpoint");
        let entry = points.entry(table.schema.clone()).or_default();
        match entry.get(&table.table) {
            Some(point) => {
                if let Err(e) = point.save(location, table_info) {
                    metrics::record_checkpoint_save_rejected(&self.cfg.task_name);
                    error!(table = %table, error = %e, "failed to save table point");
                }
            }
            None => {
                entry.insert(
                    table.table.clone(),
                    Arc::new(BinlogPoint::new(
                        TablePoint::new(location, table_info),
                        TablePoint::default(),
                        self.cfg.enable_gtid,
                    )),
                );
            }
        }
    }

    /// Save the global stream checkpoint in memory.
    pub fn save_global_point(&self, location: Location) {
        debug!(location = %location, "save global checkpoint");
        if let Err(e) = self.global_point.save(location, None) {
            metrics::record_checkpoint_save_rejected(&self.cfg.task_name);
            error!(error = %e, "failed to save global point");
        }
    }

    /// Record where safe mode may end. Only a strictly newer location (or a
    /// reset to `None`) replaces the stored one; any change raises the
    /// needs-flush flag.
    pub fn save_safe_mode_exit_point(&self, point: Option<Location>) {
        self.set_safe_mode_exit_point(point);
    }

    fn set_safe_mode_exit_point(&self, point: Option<Location>) {
        let mut stored = self.safe_mode_exit_point.write().unwrap();
        let replace = match (&*stored, &point) {
            (None, _) | (_, None) => true,
            (Some(old), Some(new)) => {
                compare_locations(new, old, self.cfg.enable_gtid) == Ordering::Greater
            }
        };
        if replace {
            *stored = point;
            self.need_flush_safe_mode_exit_point
                .store(true, AtomicOrdering::SeqCst);
        }
    }

    pub fn safe_mode_exit_point(&self) -> Option<Location> {
        self.safe_mode_exit_point.read().unwrap().clone()
    }

    /// Whether an event at `location` was already processed for `table`.
    ///
    /// DDL events and position-ordered DML can be skipped at `<=` because
    /// positions are unique per event. GTID-ordered DML only skips at `<`:
    /// several DML events share one GTID, and dropping the siblings of a
    /// half-applied GTID would lose rows.
    pub fn is_older_than_table_point(
        &self,
        table: &TableName,
        location: &Location,
        is_ddl: bool,
    ) -> bool {
        let points = self.points.read().unwrap();
        let Some(point) = points.get(&table.schema).and_then(|m| m.get(&table.table)) else {
            return false;
        };
        let old = point.location();
        debug!(location = %location, old_location = %old, "compare table location");
        let cmp = compare_locations(location, &old, self.cfg.enable_gtid);
        if is_ddl || !self.cfg.enable_gtid {
            cmp != Ordering::Greater
        } else {
            cmp == Ordering::Less
        }
    }

    /// Freeze the out-of-date state into a snapshot for a later flush.
    ///
    /// Returns `None` when nothing needs flushing. The global point joins
    /// the snapshot when it is itself out of date, has never been flushed,
    /// or when a synchronous flush must carry the safe-mode exit pointer.
    pub fn snapshot(&self, is_sync_flush: bool) -> Option<SnapshotInfo> {
        let points = self.points.read().unwrap();
        let mut queue = self.snapshots.lock().unwrap();
        queue.seq += 1;
        let id = queue.seq;

        let mut table_points: HashMap<String, HashMap<String, TablePoint>> = HashMap::new();
        for (schema, tables) in points.iter() {
            let mut snaps = HashMap::new();
            for (table, point) in tables {
                if point.out_of_date() {
                    snaps.insert(table.clone(), point.saved_point());
                }
            }
            if !snaps.is_empty() {
                table_points.insert(schema.clone(), snaps);
            }
        }

        let flush_global = self.global_point.out_of_date()
            || self.global_point_save_time.read().unwrap().is_none()
            || (is_sync_flush
                && self
                    .need_flush_safe_mode_exit_point
                    .load(AtomicOrdering::SeqCst));

        if table_points.is_empty() && !flush_global {
            return None;
        }

        let global_point = self.global_point.saved_point();
        let global_pos = global_point.location.clone();
        queue.snapshots.push(Snapshot {
            id,
            global_point: flush_global.then_some(global_point),
            global_point_save_time: flush_global.then_some(Instant::now()),
            points: table_points,
        });
        *self.last_snapshot_creation_time.write().unwrap() = Some(Instant::now());
        metrics::set_checkpoint_pending_snapshots(&self.cfg.task_name, queue.snapshots.len());

        Some(SnapshotInfo { id, global_pos })
    }

    /// Durably flush the snapshot at the head of the queue.
    ///
    /// `snapshot_id` must name the head snapshot; flushing out of order is
    /// a scheduling bug and panics. Tables in `except_tables` are skipped
    /// (their groups still hold unresolved shard DDL); `extra_sqls` ride in
    /// the same batch.
    pub async fn flush_points_except(
        &self,
        snapshot_id: u64,
        except_tables: &[TableName],
        extra_sqls: Vec<String>,
        extra_args: Vec<Vec<SqlParam>>,
    ) -> Result<()> {
        let snapshot = {
            let mut queue = self.snapshots.lock().unwrap();
            let head_id = queue.snapshots.first().map(|s| s.id);
            if head_id != Some(snapshot_id) {
                panic!(
                    "checkpoint snapshot {snapshot_id} is not at the queue head (head: {head_id:?})"
                );
            }
            queue.snapshots.remove(0)
        };

        let mut excepts: HashMap<&str, HashSet<&str>> = HashMap::new();
        for table in except_tables {
            excepts
                .entry(table.schema.as_str())
                .or_default()
                .insert(table.table.as_str());
        }

        let mut sqls = Vec::with_capacity(BATCH_FLUSH_POINTS);
        let mut args = Vec::with_capacity(BATCH_FLUSH_POINTS);

        if let Some(global) = &snapshot.global_point {
            let exit = self.safe_mode_exit_point();
            let (sql, arg) =
                self.gen_update_sql("", "", &global.location, exit.as_ref(), None, true);
            sqls.push(sql);
            args.push(arg);
        }

        // Pairs of (live entry, frozen point) whose flushed location will
        // advance once the batch lands.
        let mut flushed_points: Vec<(Arc<BinlogPoint>, TablePoint)> = Vec::new();
        {
            let points = self.points.read().unwrap();
            for (schema, tables) in &snapshot.points {
                for (table, frozen) in tables {
                    if excepts
                        .get(schema.as_str())
                        .is_some_and(|s| s.contains(table.as_str()))
                    {
                        continue;
                    }
                    let Some(entry) = points.get(schema).and_then(|m| m.get(table)) else {
                        // dropped since the snapshot was taken
                        continue;
                    };
                    if !entry.out_of_date_by(&frozen.location) {
                        continue;
                    }
                    let ti_json = serialize_table_info(schema, table, &frozen.table_info)?;
                    let (sql, arg) = self.gen_update_sql(
                        schema,
                        table,
                        &frozen.location,
                        None,
                        Some(ti_json),
                        false,
                    );
                    sqls.push(sql);
                    args.push(arg);
                    flushed_points.push((Arc::clone(entry), frozen.clone()));
                }
            }
        }

        sqls.extend(extra_sqls);
        args.extend(extra_args);

        let start = Instant::now();
        let point_count = flushed_points.len();
        self.run_with_deadline(sqls, args).await?;
        metrics::record_checkpoint_flush(&self.cfg.task_name, point_count, start.elapsed());

        if let Some(global) = snapshot.global_point {
            self.global_point.flush_by(global);
            *self.global_point_save_time.write().unwrap() = snapshot.global_point_save_time;
        }
        for (entry, frozen) in flushed_points {
            if entry.out_of_date_by(&frozen.location) {
                entry.flush_by(frozen);
            }
        }
        self.need_flush_safe_mode_exit_point
            .store(false, AtomicOrdering::SeqCst);
        metrics::set_checkpoint_pending_snapshots(
            &self.cfg.task_name,
            self.snapshots.lock().unwrap().snapshots.len(),
        );
        Ok(())
    }

    /// Persist schema snapshots for the given tables without moving any
    /// location, creating entries at the global position where missing.
    pub async fn flush_points_with_table_infos(
        &self,
        tables: &[TableName],
        table_infos: &[Arc<TableInfo>],
    ) -> Result<()> {
        if tables.len() != table_infos.len() {
            return Err(EngineError::Config(format!(
                "tables and table infos differ in length: {} vs {}",
                tables.len(),
                table_infos.len()
            )));
        }

        for chunk_start in (0..tables.len()).step_by(BATCH_FLUSH_POINTS) {
            let chunk_end = (chunk_start + BATCH_FLUSH_POINTS).min(tables.len());
            let mut sqls = Vec::with_capacity(chunk_end - chunk_start);
            let mut args = Vec::with_capacity(chunk_end - chunk_start);
            let mut flushed: Vec<Arc<BinlogPoint>> = Vec::with_capacity(chunk_end - chunk_start);
            {
                let mut points = self.points.write().unwrap();
                for i in chunk_start..chunk_end {
                    let table = &tables[i];
                    let ti = &table_infos[i];
                    let existing = points
                        .get(&table.schema)
                        .and_then(|m| m.get(&table.table))
                        .cloned();
                    let point = match existing {
                        Some(point) => point,
                        None => {
                            self.save_table_point_locked(
                                &mut points,
                                table,
                                self.global_point.location(),
                                Some(Arc::clone(ti)),
                            );
                            Arc::clone(&points[&table.schema][&table.table])
                        }
                    };
                    let ti_json =
                        serialize_table_info(&table.schema, &table.table, &Some(Arc::clone(ti)))?;
                    let location = point.location();
                    let (sql, arg) = self.gen_update_sql(
                        &table.schema,
                        &table.table,
                        &location,
                        None,
                        Some(ti_json),
                        false,
                    );
                    sqls.push(sql);
                    args.push(arg);
                    flushed.push(point);
                }
            }
            self.run_with_deadline(sqls, args).await?;
            for point in flushed {
                point.flush();
            }
        }
        Ok(())
    }

    /// Upsert the global row carrying the safe-mode exit pointer, without
    /// moving the flushed global location.
    pub async fn flush_safe_mode_exit_point(&self) -> Result<()> {
        let flushed_global = self.global_point.flushed_location();
        let exit = self.safe_mode_exit_point();
        let (sql, arg) = self.gen_update_sql("", "", &flushed_global, exit.as_ref(), None, true);
        self.run_with_deadline(vec![sql], vec![arg]).await?;
        self.need_flush_safe_mode_exit_point
            .store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    /// Delete one table's checkpoint, in memory and in the store.
    pub async fn delete_table_point(&self, table: &TableName) -> Result<()> {
        {
            let points = self.points.read().unwrap();
            if points
                .get(&table.schema)
                .and_then(|m| m.get(&table.table))
                .is_none()
            {
                return Ok(());
            }
        }
        info!(table = %table, "delete table checkpoint");
        let sql = format!(
            "DELETE FROM {} WHERE id = ? AND cp_schema = ? AND cp_table = ?",
            self.table_name
        );
        self.run_with_deadline(
            vec![sql],
            vec![vec![
                SqlParam::Str(self.id.clone()),
                SqlParam::Str(table.schema.clone()),
                SqlParam::Str(table.table.clone()),
            ]],
        )
        .await?;
        if let Some(m) = self.points.write().unwrap().get_mut(&table.schema) {
            m.remove(&table.table);
        }
        Ok(())
    }

    /// Delete every checkpoint under one source schema.
    pub async fn delete_schema_point(&self, schema: &str) -> Result<()> {
        if !self.points.read().unwrap().contains_key(schema) {
            return Ok(());
        }
        info!(schema, "delete schema checkpoint");
        let sql = format!(
            "DELETE FROM {} WHERE id = ? AND cp_schema = ?",
            self.table_name
        );
        self.run_with_deadline(
            vec![sql],
            vec![vec![
                SqlParam::Str(self.id.clone()),
                SqlParam::Str(schema.to_string()),
            ]],
        )
        .await?;
        self.points.write().unwrap().remove(schema);
        Ok(())
    }

    /// Roll every entry back to its flushed point and realign the schema
    /// tracker with the flushed schemas.
    pub fn rollback(&self, tracker: &dyn SchemaTracker) {
        let points = self.points.read().unwrap();
        self.global_point.rollback(tracker, "");

        let mut tables_to_create: HashMap<String, HashMap<String, Arc<TableInfo>>> = HashMap::new();
        for (schema, tables) in points.iter() {
            for (table_name, point) in tables {
                let table = TableName::new(schema.clone(), table_name.clone());
                let from = point.location();
                if point.rollback(tracker, schema) {
                    info!(table = %table, from = %from, to = %point.flushed_location(), "rollback checkpoint");
                    if let Err(e) = tracker.drop_table(&table) {
                        warn!(table = %table, error = %e, "failed to drop table from schema tracker");
                    }
                    if let Some(ti) = point.table_info() {
                        if let Err(e) = tracker.create_schema_if_not_exists(schema) {
                            error!(schema, error = %e, "cannot create schema on tracker during rollback");
                        }
                        tables_to_create
                            .entry(schema.clone())
                            .or_default()
                            .insert(table_name.clone(), ti);
                    }
                }
            }
        }
        if let Err(e) = tracker.batch_create_table_if_not_exist(&tables_to_create) {
            error!(error = %e, "cannot restore tables on tracker during rollback");
        }

        // Drop tracker tables with no checkpoint entry at all.
        for table in tracker.all_tables() {
            let tracked = points
                .get(&table.schema)
                .is_some_and(|m| m.contains_key(&table.table));
            if !tracked {
                let res = tracker.drop_table(&table);
                info!(table = %table, ok = res.is_ok(), "dropped tracker table with no checkpoint");
            }
        }
    }

    /// Repair in-memory key casing after a schema-identifier case change,
    /// then flush synchronously if anything moved.
    pub async fn check_and_update(
        &self,
        schemas: HashMap<String, String>,
        tables: HashMap<String, HashMap<String, String>>,
    ) -> Result<()> {
        let mut changed = false;
        {
            let mut points = self.points.write().unwrap();
            for (lc_schema, table_map) in &tables {
                let Some(table_points) = points.get_mut(lc_schema) else {
                    continue;
                };
                for (lc_table, cased_table) in table_map {
                    if let Some(point) = table_points.remove(lc_table) {
                        table_points.insert(cased_table.clone(), point);
                        changed = true;
                    }
                }
            }
            for (lc_schema, cased_schema) in &schemas {
                if let Some(table_points) = points.remove(lc_schema) {
                    points.insert(cased_schema.clone(), table_points);
                    changed = true;
                }
            }
        }

        if changed {
            if let Some(info) = self.snapshot(true) {
                return self
                    .flush_points_except(info.id, &[], Vec::new(), Vec::new())
                    .await;
            }
        }
        Ok(())
    }

    pub fn global_point(&self) -> Location {
        self.global_point.location()
    }

    pub fn flushed_global_point(&self) -> Location {
        self.global_point.flushed_location()
    }

    /// Saved location per table.
    pub fn table_points(&self) -> HashMap<String, HashMap<String, Location>> {
        let points = self.points.read().unwrap();
        points
            .iter()
            .map(|(schema, tables)| {
                (
                    schema.clone(),
                    tables
                        .iter()
                        .map(|(table, point)| (table.clone(), point.location()))
                        .collect(),
                )
            })
            .collect()
    }

    pub fn get_flushed_table_info(&self, table: &TableName) -> Option<Arc<TableInfo>> {
        self.points
            .read()
            .unwrap()
            .get(&table.schema)
            .and_then(|m| m.get(&table.table))
            .and_then(|p| p.flushed_table_info())
    }

    pub fn global_point_save_time(&self) -> Option<Instant> {
        *self.global_point_save_time.read().unwrap()
    }

    /// Whether the flush interval has elapsed since the global point was
    /// last durably saved.
    pub fn check_global_point(&self) -> bool {
        let interval = Duration::from_secs(self.cfg.flush_interval_secs);
        match *self.global_point_save_time.read().unwrap() {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    /// Whether the flush interval has elapsed since the last snapshot was
    /// created.
    pub fn check_last_snapshot_creation_time(&self) -> bool {
        let interval = Duration::from_secs(self.cfg.flush_interval_secs);
        match *self.last_snapshot_creation_time.read().unwrap() {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    async fn run_with_deadline(
        &self,
        sqls: Vec<String>,
        args: Vec<Vec<SqlParam>>,
    ) -> Result<()> {
        if sqls.is_empty() {
            return Ok(());
        }
        let deadline = Duration::from_secs(self.cfg.flush_timeout_secs);
        match tokio::time::timeout(deadline, self.db.execute(sqls, args)).await {
            Ok(res) => res,
            Err(_) => Err(EngineError::CheckpointStore(
                "checkpoint write deadline exceeded".to_string(),
            )),
        }
    }

    /// Build one UPSERT. `INSERT ... ON DUPLICATE KEY UPDATE` rather than
    /// `REPLACE INTO` keeps `create_time` intact on existing rows.
    fn gen_update_sql(
        &self,
        cp_schema: &str,
        cp_table: &str,
        location: &Location,
        safe_mode_exit: Option<&Location>,
        table_info_json: Option<String>,
        is_global: bool,
    ) -> (String, Vec<SqlParam>) {
        let sql = format!(
            "INSERT INTO {} \
             (id, cp_schema, cp_table, binlog_name, binlog_pos, binlog_gtid, \
              exit_safe_binlog_name, exit_safe_binlog_pos, exit_safe_binlog_gtid, \
              table_info, is_global) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
              binlog_name = VALUES(binlog_name), \
              binlog_pos = VALUES(binlog_pos), \
              binlog_gtid = VALUES(binlog_gtid), \
              exit_safe_binlog_name = VALUES(exit_safe_binlog_name), \
              exit_safe_binlog_pos = VALUES(exit_safe_binlog_pos), \
              exit_safe_binlog_gtid = VALUES(exit_safe_binlog_gtid), \
              table_info = VALUES(table_info), \
              is_global = VALUES(is_global)",
            self.table_name
        );

        let (exit_name, exit_pos, exit_gtid) = match safe_mode_exit {
            Some(loc) => (
                loc.file.clone(),
                loc.pos,
                loc.gtid_set.clone().unwrap_or_default(),
            ),
            None => (String::new(), 0, String::new()),
        };

        let args = vec![
            SqlParam::Str(self.id.clone()),
            SqlParam::Str(cp_schema.to_string()),
            SqlParam::Str(cp_table.to_string()),
            SqlParam::Str(location.file.clone()),
            SqlParam::U32(location.pos),
            SqlParam::Str(location.gtid_set.clone().unwrap_or_default()),
            SqlParam::Str(exit_name),
            SqlParam::U32(exit_pos),
            SqlParam::Str(exit_gtid),
            SqlParam::Str(table_info_json.unwrap_or_else(|| "null".to_string())),
            SqlParam::Bool(is_global),
        ];
        (sql, args)
    }
}

fn serialize_table_info(
    schema: &str,
    table: &str,
    table_info: &Option<Arc<TableInfo>>,
) -> Result<String> {
    match table_info {
        Some(ti) => {
            serde_json::to_string(ti.as_ref()).map_err(|e| EngineError::SchemaSerialization {
                schema: schema.to_string(),
                table: table.to_string(),
                source: e,
            })
        }
        None => Ok("null".to_string()),
    }
}

impl<D: CheckpointDb> fmt::Display for RemoteCheckpoint<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.global_point)
    }
}
