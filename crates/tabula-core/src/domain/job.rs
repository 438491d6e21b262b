//! BatchJob and Batch: a Task's records split into fixed-size ordered slices.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::record::{Record, RecordKey};

/// Batch status (aggregated over every round that touched the batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Not yet sent.
    Pending,

    /// A request for (part of) this batch is in flight.
    Dispatched,

    /// Every record of the batch is resolved.
    Completed,

    /// Some records still unresolved.
    Partial,

    /// Transport retries exhausted in the last round that touched the batch.
    Failed,
}

/// A contiguous slice of the parent job's records.
///
/// Design: the batch holds a range into `BatchJob::records` rather than its
/// own copy, so re-assembly only ever looks at record keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub batch_index: usize,
    pub range: Range<usize>,

    /// Number of retry rounds that resubmitted records of this batch.
    pub attempt_count: u32,

    pub status: BatchStatus,
}

impl Batch {
    pub fn new(batch_index: usize, range: Range<usize>) -> Self {
        Self {
            batch_index,
            range,
            attempt_count: 0,
            status: BatchStatus::Pending,
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn mark_dispatched(&mut self) {
        self.status = BatchStatus::Dispatched;
    }

    /// Count one retry round, never beyond `max_retries`.
    pub fn record_retry(&mut self, max_retries: u32) {
        self.attempt_count = (self.attempt_count + 1).min(max_retries);
        self.status = BatchStatus::Dispatched;
    }

    pub fn settle(&mut self, unresolved: usize, failed: bool) {
        self.status = if failed {
            BatchStatus::Failed
        } else if unresolved == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Partial
        };
    }
}

/// All batches of one Task.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub parent_task_id: TaskId,
    pub batch_size: NonZeroUsize,
    pub batches: Vec<Batch>,
    records: Vec<Record>,
    index: HashMap<RecordKey, usize>,
}

impl BatchJob {
    /// `records` must have unique keys; the partitioner checks this.
    pub(crate) fn new(
        parent_task_id: TaskId,
        batch_size: NonZeroUsize,
        records: Vec<Record>,
        batches: Vec<Batch>,
    ) -> Self {
        let index = records
            .iter()
            .enumerate()
            .map(|(position, record)| (record.key.clone(), position))
            .collect();
        Self {
            parent_task_id,
            batch_size,
            batches,
            records,
            index,
        }
    }

    /// All records in original input order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_of(&self, batch: &Batch) -> &[Record] {
        &self.records[batch.range.clone()]
    }

    pub fn total(&self) -> usize {
        self.records.len()
    }

    /// Original input position of `key`.
    pub fn position_of(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn record(&self, key: &str) -> Option<&Record> {
        self.position_of(key).map(|position| &self.records[position])
    }

    /// Index of the batch that owns `key`.
    pub fn batch_of(&self, key: &str) -> Option<usize> {
        let position = self.position_of(key)?;
        self.batches
            .iter()
            .position(|batch| batch.range.contains(&position))
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.records.iter().map(|record| &record.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn job_of(n: usize, size: usize) -> BatchJob {
        let records: Vec<Record> = (0..n)
            .map(|i| Record::new(format!("R{i}"), [("text", "x")]))
            .collect();
        let batches = (0..n)
            .step_by(size)
            .enumerate()
            .map(|(i, start)| Batch::new(i, start..(start + size).min(n)))
            .collect();
        BatchJob::new(
            TaskId::from_ulid(Ulid::new()),
            NonZeroUsize::new(size).unwrap(),
            records,
            batches,
        )
    }

    #[test]
    fn lookups_follow_input_order() {
        let job = job_of(7, 3);
        assert_eq!(job.total(), 7);
        assert_eq!(job.position_of("R4"), Some(4));
        assert_eq!(job.batch_of("R4"), Some(1));
        assert_eq!(job.batch_of("R6"), Some(2));
        assert_eq!(job.batch_of("nope"), None);
        assert_eq!(job.records_of(&job.batches[2]).len(), 1);
    }

    #[rstest]
    #[case::clean(0, false, BatchStatus::Completed)]
    #[case::partial(2, false, BatchStatus::Partial)]
    #[case::failed(0, true, BatchStatus::Failed)]
    fn settle_sets_status(#[case] unresolved: usize, #[case] failed: bool, #[case] expected: BatchStatus) {
        let mut batch = Batch::new(0, 0..3);
        batch.mark_dispatched();
        batch.settle(unresolved, failed);
        assert_eq!(batch.status, expected);
    }

    #[test]
    fn attempt_count_is_capped() {
        let mut batch = Batch::new(0, 0..3);
        for _ in 0..5 {
            batch.record_retry(2);
        }
        assert_eq!(batch.attempt_count, 2);
    }
}
