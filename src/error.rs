// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the changefeed engine.
//!
//! Errors are categorized by the contract they break, not by the crate that
//! produced them. Protocol violations (duplicate operations, snapshot id
//! mismatches, equal-revision owner conflicts) are *not* errors: they are
//! bugs and the offending subsystem panics instead.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Kv` | Depends | Coordination-service RPC failure |
//! | `Cancelled` | No | Caller's context was cancelled |
//! | `NonMonotonicSave` | No | Checkpoint save older than the stored point |
//! | `SchemaSerialization` | No | Schema snapshot would not serialize |
//! | `CheckpointStore` | No | Downstream checkpoint DB failure |
//! | `SorterStorage` | No | Embedded KV commit failure (fatal to the actor) |
//! | `InvalidTaskMode` | No | Task mode has no usable start position |
//! | `MetaParse` | No | Dump manifest did not parse |
//! | `Config` | No | Configuration invalid |
//! | `Pipeline` | No | A pipeline processor failed |
//!
//! # Retry Behavior
//!
//! Use [`EngineError::is_retryable()`] to decide whether to retry with
//! backoff. Only transient KV errors qualify; everything else needs either
//! operator attention or a code fix.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Classification of a coordination-service failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvErrorKind {
    /// The caller's context was cancelled mid-call.
    Canceled,
    /// The per-call deadline elapsed.
    DeadlineExceeded,
    /// The lease being revoked or queried no longer exists.
    LeaseNotFound,
    /// A transactional commit conflicted and cannot be blindly retried.
    TxnConflict,
    /// The service was unreachable or returned a transient fault.
    Unavailable,
    /// Anything else.
    Internal,
}

/// Errors that can occur in the coordination plane.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Coordination-service RPC failure, after any retries were exhausted.
    #[error("kv error ({op}): {message}")]
    Kv {
        op: &'static str,
        kind: KvErrorKind,
        message: String,
    },

    /// The caller's cancellation propagated through an operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A checkpoint save carried a location older than the stored one.
    ///
    /// The caller logs and keeps the prior value; the save is not retried.
    #[error("checkpoint save not monotonic: incoming {incoming} older than saved {saved}")]
    NonMonotonicSave { incoming: String, saved: String },

    /// A table schema snapshot failed to serialize for persistence.
    /// Aborts the snapshot flush as a task-level fatal error.
    #[error("cannot serialize schema snapshot for {schema}.{table}: {source}")]
    SchemaSerialization {
        schema: String,
        table: String,
        #[source]
        source: serde_json::Error,
    },

    /// Downstream checkpoint database failure.
    #[error("checkpoint store error: {0}")]
    CheckpointStore(String),

    /// Embedded sorter storage failure. Fatal to the owning actor.
    #[error("sorter storage error: {0}")]
    SorterStorage(String),

    /// The configured task mode provides no usable start position.
    #[error("invalid task mode: {0}")]
    InvalidTaskMode(String),

    /// The dump manifest did not parse. Carries the file contents so the
    /// operator can see what was actually on disk.
    #[error("cannot parse dump manifest: {reason}; contents:\n{contents}")]
    MetaParse { reason: String, contents: String },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pipeline processor returned a hard failure.
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

impl EngineError {
    /// Build a KV error for the given operation.
    pub fn kv(op: &'static str, kind: KvErrorKind, message: impl Into<String>) -> Self {
        Self::Kv {
            op,
            kind,
            message: message.into(),
        }
    }

    /// Check if this error is retryable with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kv { kind, .. } => matches!(
                kind,
                KvErrorKind::Unavailable | KvErrorKind::DeadlineExceeded
            ),
            _ => false,
        }
    }

    /// The KV error kind, when this is a KV error.
    pub fn kv_kind(&self) -> Option<KvErrorKind> {
        match self {
            Self::Kv { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        Self::CheckpointStore(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_unavailable_is_retryable() {
        let err = EngineError::kv("Put", KvErrorKind::Unavailable, "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Put"));
    }

    #[test]
    fn test_kv_cancelled_not_retryable() {
        let err = EngineError::kv("Get", KvErrorKind::Canceled, "ctx done");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kv_lease_not_found_not_retryable() {
        let err = EngineError::kv("Revoke", KvErrorKind::LeaseNotFound, "lease expired");
        assert!(!err.is_retryable());
        assert_eq!(err.kv_kind(), Some(KvErrorKind::LeaseNotFound));
    }

    #[test]
    fn test_non_monotonic_save_not_retryable() {
        let err = EngineError::NonMonotonicSave {
            incoming: "(mysql-bin.000001, 4)".to_string(),
            saved: "(mysql-bin.000002, 4)".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("not monotonic"));
    }

    #[test]
    fn test_meta_parse_includes_contents() {
        let err = EngineError::MetaParse {
            reason: "no Log field".to_string(),
            contents: "Started dump at: whenever".to_string(),
        };
        assert!(err.to_string().contains("Started dump at"));
    }

    #[test]
    fn test_invalid_task_mode() {
        let err = EngineError::InvalidTaskMode("full".to_string());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("full"));
    }

    #[test]
    fn test_config_not_retryable() {
        assert!(!EngineError::Config("bad".into()).is_retryable());
    }
}
