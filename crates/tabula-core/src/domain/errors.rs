//! Errors - エラー型と分類
//!
//! 関心ごとに enum を分けています。
//! - TransportError: 推論サービスへの通信失敗（backoff 付きで再試行）
//! - BatchFailure: 再試行上限に達した Batch
//! - ValidationError: 応答テキストが表として解釈できない
//! - PersistenceError: Record store への書き込み・読み込み失敗
//! - SubmitError: submit 時に同期的に返す拒否
//! - ProcessError: Task 全体を failed にするシステムエラー

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::record::RecordKey;
use super::state::TaskStatus;

/// ErrorKind は実行エラーの運用分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: 基盤側の障害（store / runtime）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failure talking to the inference service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("inference call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limited by inference service")]
    RateLimited { retry_after: Option<Duration> },

    /// The service refused the request itself (bad request, auth, ...).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Timeout(_)
            | TransportError::Connection(_)
            | TransportError::RateLimited { .. } => ErrorKind::Transient,
            TransportError::Rejected(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Server supplied wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A Batch whose transport retries were exhausted (or hit a non-retryable error).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("batch {batch_index} (round {round}) failed after {calls} call(s): {last_error}")]
pub struct BatchFailure {
    pub batch_index: usize,
    pub round: u32,
    pub calls: u32,
    #[source]
    pub last_error: TransportError,
}

/// The response text could not be read as the expected table at all.
///
/// Row-level problems are not errors; they end up in the validation report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("response contains no table rows")]
    EmptyResponse,

    #[error("header does not match schema (unexpected: {unexpected:?}, missing: {missing:?})")]
    HeaderMismatch {
        unexpected: Vec<String>,
        missing: Vec<String>,
    },

    /// Same column names as the schema, different order or repetition.
    #[error("header columns out of order: {found:?}")]
    HeaderLayout { found: Vec<String> },
}

/// Durable store failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    /// Constraint violations never succeed on retry.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("source not found: {0}")]
    NotFound(String),
}

impl PersistenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistenceError::Transient(_) => ErrorKind::Infrastructure,
            PersistenceError::Integrity(_) | PersistenceError::NotFound(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Transient(_))
    }
}

/// Synchronous rejection from `submit`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("a task for '{logical_key}' is already {status} ({existing})")]
    Duplicate {
        logical_key: String,
        existing: TaskId,
        status: TaskStatus,
    },

    /// Backpressure: the caller should retry later.
    #[error("queue is full ({capacity} pending tasks)")]
    QueueFull { capacity: usize },
}

/// System-level failure that stops a Task before any Batch could complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to load records: {0}")]
    Source(#[from] PersistenceError),

    #[error("record key '{0}' appears more than once in the source")]
    DuplicateRecordKey(RecordKey),

    #[error("single task must resolve to exactly one record, got {0}")]
    SingleArity(usize),

    #[error("context unavailable: {0}")]
    Context(String),

    #[error("none of the {failed} batch(es) completed: {last}")]
    NoBatchCompleted { failed: usize, last: BatchFailure },

    #[error("task execution aborted: {0}")]
    Aborted(String),
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::Source(e) => e.kind(),
            ProcessError::NoBatchCompleted { .. } => ErrorKind::Transient,
            ProcessError::Aborted(_) => ErrorKind::Infrastructure,
            ProcessError::DuplicateRecordKey(_)
            | ProcessError::SingleArity(_)
            | ProcessError::Context(_) => ErrorKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::timeout(TransportError::Timeout(Duration::from_secs(1)), true)]
    #[case::connection(TransportError::Connection("reset".into()), true)]
    #[case::rate_limited(TransportError::RateLimited { retry_after: None }, true)]
    #[case::rejected(TransportError::Rejected("400".into()), false)]
    fn transport_errors_are_classified(#[case] error: TransportError, #[case] retryable: bool) {
        assert_eq!(error.is_retryable(), retryable);
    }

    #[test]
    fn integrity_errors_are_not_retried() {
        assert!(PersistenceError::Transient("lock timeout".into()).is_retryable());
        assert!(!PersistenceError::Integrity("duplicate key".into()).is_retryable());
        assert_eq!(
            PersistenceError::Integrity("x".into()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn rate_limit_exposes_retry_after() {
        let err = TransportError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(TransportError::Connection("x".into()).retry_after(), None);
    }
}
