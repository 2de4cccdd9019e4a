//! Configuration for the changefeed engine.
//!
//! Each subsystem gets its own config struct; [`EngineConfig`] groups them.
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use changefeed_engine::config::{EngineConfig, CheckpointConfig};
//!
//! let config = EngineConfig {
//!     changefeed_id: "feed-1".into(),
//!     checkpoint: CheckpointConfig {
//!         enable_gtid: true,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── changefeed_id: String       # Replication job identity
//! ├── kv: KvClientConfig          # Coordination-service client tuning
//! ├── sorter: SorterConfig        # Storage actor tuning
//! ├── checkpoint: CheckpointConfig # Watermark persistence
//! └── agent: AgentConfig          # Owner/agent protocol tuning
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::location::Location;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for one changefeed's coordination plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The replication job this engine instance coordinates.
    #[serde(default)]
    pub changefeed_id: String,

    #[serde(default)]
    pub kv: KvClientConfig,

    #[serde(default)]
    pub sorter: SorterConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

impl EngineConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(changefeed_id: &str) -> Self {
        Self {
            changefeed_id: changefeed_id.to_string(),
            kv: KvClientConfig::for_testing(),
            sorter: SorterConfig::for_testing(),
            checkpoint: CheckpointConfig::for_testing(),
            agent: AgentConfig::for_testing(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// KvClientConfig: retry/backoff and watch liveness tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Tuning for the retrying coordination-service client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvClientConfig {
    /// Base delay for exponential backoff between retries.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Ceiling for the backoff delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Maximum attempts per point operation.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Overall deadline for a transactional commit.
    #[serde(default = "default_txn_timeout_secs")]
    pub txn_timeout_secs: u64,

    /// Buffer capacity of the watch output channel.
    #[serde(default = "default_watch_buffer")]
    pub watch_buffer: usize,

    /// If no response arrives on a watch for this long, the watch is
    /// considered stuck and reopened at the last delivered revision.
    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,

    /// Cadence of progress requests and of the blocked-forward warning tick.
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    // matches the default max interval of the usual backoff stacks
    60_000
}

fn default_max_tries() -> u32 {
    8
}

fn default_txn_timeout_secs() -> u64 {
    30
}

fn default_watch_buffer() -> usize {
    16
}

fn default_watch_timeout_secs() -> u64 {
    10
}

fn default_progress_interval_secs() -> u64 {
    1
}

impl Default for KvClientConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_tries: default_max_tries(),
            txn_timeout_secs: default_txn_timeout_secs(),
            watch_buffer: default_watch_buffer(),
            watch_timeout_secs: default_watch_timeout_secs(),
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

impl KvClientConfig {
    /// Fast-fail tuning for tests.
    pub fn for_testing() -> Self {
        Self {
            backoff_base_ms: 1,
            backoff_max_ms: 10,
            max_tries: 3,
            txn_timeout_secs: 1,
            watch_buffer: 16,
            watch_timeout_secs: 1,
            progress_interval_secs: 1,
        }
    }

    /// Backoff delay for a 1-indexed attempt, capped at the ceiling.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SorterConfig: storage actor tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Tuning for the sorter storage actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorterConfig {
    /// Storage engine block size in bytes. The write batch commits once it
    /// holds `block_size * 16` bytes, which keeps commits amortized well
    /// above the block granularity.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Maximum concurrently open iterators per actor.
    #[serde(default = "default_iterator_concurrency")]
    pub iterator_concurrency: usize,

    /// Deletions accumulated before a compaction is offered to the
    /// scheduler.
    #[serde(default = "default_compaction_deletion_threshold")]
    pub compaction_deletion_threshold: usize,
}

fn default_block_size() -> usize {
    64 * 1024
}

fn default_iterator_concurrency() -> usize {
    128
}

fn default_compaction_deletion_threshold() -> usize {
    160_000
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            iterator_concurrency: default_iterator_concurrency(),
            compaction_deletion_threshold: default_compaction_deletion_threshold(),
        }
    }
}

impl SorterConfig {
    /// Small batches and tight limits so tests can trigger every path.
    pub fn for_testing() -> Self {
        Self {
            block_size: 4,
            iterator_concurrency: 2,
            compaction_deletion_threshold: 4,
        }
    }

    /// Target write batch size in bytes.
    pub fn write_batch_size(&self) -> usize {
        // Write batch size should be larger than block size to save CPU.
        self.block_size * 16
    }

    /// Write batch capacity; doubled to avoid reallocation between commits.
    pub fn write_batch_capacity(&self) -> usize {
        self.write_batch_size() * 2
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: watermark persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// How the checkpoint engine seeds its start position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskMode {
    /// Full dump followed by incremental replication; the start position
    /// comes from the dump manifest.
    All,
    /// Incremental only; the start position comes from `meta`.
    Incremental,
    /// Dump only; replication never runs, so there is no start position to
    /// seed.
    Dump,
}

/// Explicitly configured start position for incremental mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartMeta {
    pub binlog_name: String,
    pub binlog_pos: u32,
    #[serde(default)]
    pub binlog_gtid: Option<String>,
}

impl StartMeta {
    pub fn to_location(&self) -> Location {
        Location {
            file: self.binlog_name.clone(),
            pos: self.binlog_pos,
            gtid_set: self.binlog_gtid.clone(),
            suffix: 0,
        }
    }
}

/// Tuning and identity for the checkpoint engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Schema holding the checkpoint table on the target database.
    #[serde(default = "default_meta_schema")]
    pub meta_schema: String,

    /// Task name; the checkpoint table is `{task_name}_syncer_checkpoint`.
    #[serde(default = "default_task_name")]
    pub task_name: String,

    /// Whether locations are ordered by GTID set.
    #[serde(default)]
    pub enable_gtid: bool,

    /// Minimum interval between durable checkpoint flushes.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Deadline for one flush batch against the target database.
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,

    #[serde(default = "default_task_mode")]
    pub mode: TaskMode,

    /// Dump output directory; `all` mode reads `<dir>/metadata`.
    #[serde(default)]
    pub dir: String,

    /// Configured start position for `incremental` mode.
    #[serde(default)]
    pub meta: Option<StartMeta>,
}

fn default_meta_schema() -> String {
    "cfe_meta".to_string()
}

fn default_task_name() -> String {
    "default".to_string()
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_flush_timeout_secs() -> u64 {
    30
}

fn default_task_mode() -> TaskMode {
    TaskMode::All
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            meta_schema: default_meta_schema(),
            task_name: default_task_name(),
            enable_gtid: false,
            flush_interval_secs: default_flush_interval_secs(),
            flush_timeout_secs: default_flush_timeout_secs(),
            mode: default_task_mode(),
            dir: String::new(),
            meta: None,
        }
    }
}

impl CheckpointConfig {
    pub fn for_testing() -> Self {
        Self {
            task_name: "test".to_string(),
            flush_interval_secs: 0,
            ..Default::default()
        }
    }

    /// Qualified checkpoint table name.
    pub fn table_name(&self) -> String {
        format!("`{}`.`{}_syncer_checkpoint`", self.meta_schema, self.task_name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AgentConfig: owner/agent protocol tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Tuning for the agent side of the scheduling protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Minimum interval between checkpoints sent to the owner.
    #[serde(default = "default_send_checkpoint_interval_ms")]
    pub send_checkpoint_interval_ms: u64,
}

fn default_send_checkpoint_interval_ms() -> u64 {
    1_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            send_checkpoint_interval_ms: default_send_checkpoint_interval_ms(),
        }
    }
}

impl AgentConfig {
    pub fn for_testing() -> Self {
        Self {
            send_checkpoint_interval_ms: 0,
        }
    }

    pub fn send_checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.send_checkpoint_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.kv.backoff_base_ms, 500);
        assert_eq!(cfg.kv.backoff_max_ms, 60_000);
        assert_eq!(cfg.kv.max_tries, 8);
        assert_eq!(cfg.kv.txn_timeout_secs, 30);
        assert_eq!(cfg.kv.watch_buffer, 16);
        assert_eq!(cfg.sorter.write_batch_size(), 64 * 1024 * 16);
        assert_eq!(
            cfg.sorter.write_batch_capacity(),
            cfg.sorter.write_batch_size() * 2
        );
        assert_eq!(cfg.checkpoint.flush_interval_secs, 30);
        assert!(!cfg.checkpoint.enable_gtid);
    }

    #[test]
    fn test_backoff_schedule() {
        let cfg = KvClientConfig::default();
        assert_eq!(cfg.backoff_for_attempt(1), Duration::from_millis(500));
        assert_eq!(cfg.backoff_for_attempt(2), Duration::from_millis(1_000));
        assert_eq!(cfg.backoff_for_attempt(3), Duration::from_millis(2_000));
        // capped at the ceiling
        assert_eq!(cfg.backoff_for_attempt(12), Duration::from_millis(60_000));
        assert_eq!(cfg.backoff_for_attempt(40), Duration::from_millis(60_000));
    }

    #[test]
    fn test_checkpoint_table_name() {
        let cfg = CheckpointConfig {
            meta_schema: "dm_meta".to_string(),
            task_name: "job1".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.table_name(), "`dm_meta`.`job1_syncer_checkpoint`");
    }

    #[test]
    fn test_start_meta_to_location() {
        let meta = StartMeta {
            binlog_name: "mysql-bin.000007".to_string(),
            binlog_pos: 1234,
            binlog_gtid: Some("uuid:1-9".to_string()),
        };
        let loc = meta.to_location();
        assert_eq!(loc.file, "mysql-bin.000007");
        assert_eq!(loc.pos, 1234);
        assert_eq!(loc.gtid_set.as_deref(), Some("uuid:1-9"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"changefeed_id":"cf"}"#).unwrap();
        assert_eq!(cfg.changefeed_id, "cf");
        assert_eq!(cfg.kv.max_tries, 8);
        assert_eq!(cfg.checkpoint.mode, TaskMode::All);
    }

    #[test]
    fn test_task_mode_serde() {
        let mode: TaskMode = serde_json::from_str(r#""incremental""#).unwrap();
        assert_eq!(mode, TaskMode::Incremental);
        let mode: TaskMode = serde_json::from_str(r#""dump""#).unwrap();
        assert_eq!(mode, TaskMode::Dump);
    }
}
