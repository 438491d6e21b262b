//! RecordStore port - 永続ストア（正本）
//!
//! # 要件
//! - identifier をキーにした冪等な upsert（再試行で同じキーが複数回来るため）
//! - correlation id ごとの Task ステータス投影

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{PersistenceError, Record, RecordKey, SourceRef, TaskId, TaskStatus};

/// Durable status projection of one Task, keyed by its correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusProjection {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Resolve a source reference into its ordered record set.
    async fn load(&self, source: &SourceRef) -> Result<Vec<Record>, PersistenceError>;

    /// Fetch records by identifier. Unknown identifiers are skipped.
    async fn read(&self, keys: &[RecordKey]) -> Result<Vec<Record>, PersistenceError>;

    /// Insert or overwrite the record keyed by `record.key`.
    async fn upsert(&self, record: &Record) -> Result<(), PersistenceError>;

    async fn put_status(
        &self,
        correlation_id: &str,
        projection: &StatusProjection,
    ) -> Result<(), PersistenceError>;

    async fn get_status(&self, correlation_id: &str) -> Result<Option<StatusProjection>, PersistenceError>;
}
