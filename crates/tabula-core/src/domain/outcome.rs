//! Task outcome: the merged, ordered result of one Task plus what could not be resolved.
//!
//! This is the shape the system records and explains later; it does not assume
//! anything about how batches were scheduled.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use super::attempt::CallRecord;
use super::ids::TaskId;
use super::job::BatchStatus;
use super::record::RecordKey;
use super::result::Row;
use super::state::TaskStatus;
use super::usage::Usage;

/// Why a Record is missing from the final result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum UnresolvedCause {
    /// No row came back in any round.
    Missing,
    /// Rows came back but none survived repair.
    Malformed(String),
    /// Resolved, but the durable upsert kept failing.
    NotPersisted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unresolved {
    pub key: RecordKey,
    pub cause: UnresolvedCause,
}

/// Repair applied to a row before it was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// Excess tokens folded into a free-text column.
    Realigned,
    /// Short row padded with empty trailing cells.
    Padded,
    /// Label moved from another cell into the label column.
    LabelRelocated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairNote {
    pub key: RecordKey,
    pub kind: RepairKind,
    pub round: u32,
}

/// One resolved row of the final result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRow {
    pub key: RecordKey,
    pub row: Row,
    /// Round that produced the winning value (0 = first pass).
    pub round: u32,
}

/// Reply lines that were read but not used as data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Noise {
    /// Prose before the table started.
    pub prose_lines: usize,
    /// Header-shaped lines after the first one.
    pub extra_headers: usize,
    /// Rows whose identifier was not requested.
    pub stray_rows: usize,
}

impl AddAssign for Noise {
    fn add_assign(&mut self, other: Self) {
        self.prose_lines += other.prose_lines;
        self.extra_headers += other.extra_headers;
        self.stray_rows += other.stray_rows;
    }
}

/// Where one original batch ended up after every round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_index: usize,
    pub status: BatchStatus,
    /// Retry rounds that resubmitted records of this batch.
    pub retries: u32,
    pub unresolved: usize,
}

/// Final report of a Task that reached `completed` or `completed_degraded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub header: Vec<String>,
    pub total: usize,
    pub resolved: usize,

    /// Resolved rows in original record order.
    pub rows: Vec<MergedRow>,

    /// Itemized unresolved set, in original record order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<Unresolved>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<RepairNote>,

    /// Retry rounds actually run.
    pub retry_rounds: u32,
    pub failed_batches: usize,
    /// Replies whose table could not be read at all (every identifier retried).
    #[serde(default)]
    pub rejected_replies: usize,
    #[serde(default)]
    pub noise: Noise,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batches: Vec<BatchSummary>,
    pub usage: Usage,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<CallRecord>,
}

impl TaskReport {
    pub fn status(&self) -> TaskStatus {
        if self.resolved == self.total {
            TaskStatus::Completed
        } else {
            TaskStatus::CompletedDegraded
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.status() == TaskStatus::CompletedDegraded
    }

    pub fn unresolved_keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.unresolved.iter().map(|u| &u.key)
    }

    pub fn row(&self, key: &str) -> Option<&Row> {
        self.rows
            .iter()
            .find(|merged| merged.key.as_str() == key)
            .map(|merged| &merged.row)
    }
}
