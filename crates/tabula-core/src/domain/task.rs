//! Task: one submission and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::spec::{SourceRef, Submission, TaskKind, TaskOptions};
use super::state::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid task transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Task metadata and lifecycle state.
///
/// Design:
/// - Single source of truth for task state inside the queue.
/// - Queue structures hold `TaskId` only.
/// - All state transitions happen here and are checked against the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub logical_key: String,
    pub kind: TaskKind,
    pub source: SourceRef,
    pub options: TaskOptions,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, submission: Submission, now: DateTime<Utc>) -> Self {
        Self {
            id,
            logical_key: submission.logical_key,
            kind: submission.kind,
            source: submission.source,
            options: submission.options,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Pending -> Processing.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Processing)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Processing -> Completed | CompletedDegraded.
    pub fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if status == TaskStatus::Failed {
            return Err(InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        self.transition(status)?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Processing -> Failed.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }
}
