//! Retry coordinator.
//!
//! round が終わるたびに未解決キー（missing ∪ malformed）を集めて次の manifest を作り、
//! そのキーの Record だけを元の順序で再分割して executor に戻します。
//! 上限は `RetryManifest` 自体が強制するので、ここでは判断を委ねるだけです。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::executor::BatchRequest;
use super::partition::chunk_in_order;
use crate::domain::{BatchJob, RecordKey, RetryDecision, RetryManifest, RetryReason};
use crate::ports::ContextSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCoordinator {
    max_retries: u32,
}

impl RetryCoordinator {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide what follows a round that left `unresolved` behind.
    ///
    /// `previous` is the manifest of the round that just ran (`None` after the
    /// first pass).
    pub fn decide(
        &self,
        previous: Option<&RetryManifest>,
        unresolved: BTreeMap<RecordKey, RetryReason>,
    ) -> RetryDecision {
        if unresolved.is_empty() {
            return RetryDecision::Settled;
        }
        let next = match previous {
            None => RetryManifest::first(unresolved.clone(), self.max_retries),
            Some(manifest) => manifest.next(unresolved.clone()),
        };
        match next {
            Some(manifest) => RetryDecision::Resubmit(manifest),
            None => RetryDecision::Exhausted(unresolved),
        }
    }

    /// Reduced requests holding only the manifest's records.
    ///
    /// Chunks use the job's batch size and keep original record order; every
    /// request carries the same context snapshot as the first pass.
    pub fn requests(
        &self,
        job: &BatchJob,
        manifest: &Arc<RetryManifest>,
        context: &Arc<ContextSnapshot>,
    ) -> Vec<BatchRequest> {
        chunk_in_order(job, manifest.keys())
            .into_iter()
            .enumerate()
            .map(|(batch_index, records)| BatchRequest {
                task_id: job.parent_task_id,
                batch_index,
                round: manifest.attempt_number(),
                records: records.into_iter().cloned().collect(),
                context: Arc::clone(context),
                retry: Some(Arc::clone(manifest)),
            })
            .collect()
    }

    /// Indexes of the original batches touched by `manifest`.
    pub fn touched_batches(&self, job: &BatchJob, manifest: &RetryManifest) -> BTreeSet<usize> {
        manifest
            .keys()
            .filter_map(|key| job.batch_of(key.as_str()))
            .collect()
    }
}
