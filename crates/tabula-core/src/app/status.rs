//! Status - ステータスクエリ
//!
//! Queue の状態からその場で組み立てるビューです。
//! 永続側の投影（`StatusProjection`）とは別物で、こちらは queue_position などメモリ上の情報も含みます。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{RecordKey, Task, TaskId, TaskKind, TaskReport, TaskStatus};

/// One task as seen by callers polling `status` / `status_by_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub logical_key: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Number of pending tasks ahead of this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<RecordKey>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskStatusView {
    pub fn new(task: &Task, queue_position: Option<usize>, report: Option<&TaskReport>) -> Self {
        Self {
            task_id: task.id,
            logical_key: task.logical_key.clone(),
            kind: task.kind,
            status: task.status,
            queue_position,
            error: task.error.clone(),
            resolved_count: report.map(|r| r.resolved),
            total_count: report.map(|r| r.total),
            unresolved: report
                .map(|r| r.unresolved_keys().cloned().collect())
                .unwrap_or_default(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

/// Queue-wide snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    /// Pending tasks.
    pub queue_size: usize,
    pub current_task: Option<TaskId>,
    /// Tasks known to the queue, terminal ones included.
    pub total_tasks: usize,
    /// Tasks in `processing`. Never above 1.
    pub processing: usize,
    pub capacity: usize,
    pub is_running: bool,
}
