//! Call records: one entry per request sent to the inference service.
//!
//! Transport retries of the same batch each get their own record, so the
//! report can explain where time and tokens went.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttemptId, TaskId};
use super::usage::Usage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "error", rename_all = "snake_case")]
pub enum CallOutcome {
    Replied,
    TransportFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub attempt_id: AttemptId,
    pub task_id: TaskId,
    pub batch_index: usize,
    /// 0 = first pass, n = retry round n.
    pub round: u32,
    /// 1-based call number within this batch and round.
    pub call_number: u32,
    pub outcome: CallOutcome,
    pub usage: Usage,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == CallOutcome::Replied
    }
}
