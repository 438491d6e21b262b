//! Batch partitioner.
//!
//! Record 集合を固定サイズの連続した Batch に分けます。順序は入力順のまま。
//! 最後の Batch だけが短くなり得ます。

use std::collections::HashSet;
use std::num::NonZeroUsize;

use crate::domain::{Batch, BatchJob, ProcessError, Record, RecordKey, TaskId};

/// Split `records` into `ceil(len / batch_size)` contiguous batches.
///
/// Every record lands in exactly one batch. Duplicate keys are rejected because
/// re-assembly and upsert both go by key.
pub fn partition(
    task_id: TaskId,
    records: Vec<Record>,
    batch_size: NonZeroUsize,
) -> Result<BatchJob, ProcessError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(records.len());
    for record in &records {
        if !seen.insert(record.key.as_str()) {
            return Err(ProcessError::DuplicateRecordKey(record.key.clone()));
        }
    }

    let size = batch_size.get();
    let total = records.len();
    let batches = (0..total)
        .step_by(size)
        .enumerate()
        .map(|(batch_index, start)| Batch::new(batch_index, start..(start + size).min(total)))
        .collect();

    Ok(BatchJob::new(task_id, batch_size, records, batches))
}

/// Group `keys` into request-sized chunks, in the job's original record order.
///
/// Used by retry rounds: only unresolved keys are sent, but they keep the
/// relative order they had in the source.
pub fn chunk_in_order<'a>(
    job: &'a BatchJob,
    keys: impl IntoIterator<Item = &'a RecordKey>,
) -> Vec<Vec<&'a Record>> {
    let mut positions: Vec<usize> = keys
        .into_iter()
        .filter_map(|key| job.position_of(key.as_str()))
        .collect();
    positions.sort_unstable();
    positions.dedup();

    let records = job.records();
    positions
        .chunks(job.batch_size.get())
        .map(|chunk| chunk.iter().map(|&position| &records[position]).collect())
        .collect()
}
