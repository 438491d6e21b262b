//! TaskProcessor - 1 つの Task を最後まで実行する
//!
//! # フロー
//! 1. RecordStore::load() で Record 集合を取得（Single は 1 件であること）
//! 2. partition() で Batch に分割
//! 3. ContextSource::snapshot() を 1 回だけ取り、`Arc` で全 worker に共有
//! 4. first pass: 全 Batch を executor へ
//! 5. RetryCoordinator が manifest を作る限り、未解決分だけ再送
//! 6. Merger::finalize() で順序付け・upsert
//!
//! first pass の Batch が 1 つも完了しなかった場合だけ `ProcessError`。
//! 未解決が残っても Task は `completed_degraded` で終わります。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::coordinator::RetryCoordinator;
use super::executor::{BatchExecutor, BatchRequest, BatchRun};
use super::merge::{BatchVerdict, MergeSink, Merged, Merger};
use super::partition::partition;
use super::repair::Validator;
use crate::domain::{
    BatchFailure, BatchJob, BatchSummary, CallRecord, ProcessError, RecordKey, RetryDecision,
    RetryManifest, RetryReason, TableSchema, Task, TaskKind, TaskReport, UnresolvedCause, Usage,
};
use crate::ports::{ContextSource, RecordStore};
use crate::queue::RetryPolicy;

const DEFAULT_BATCH_SIZE: NonZeroUsize = match NonZeroUsize::new(30) {
    Some(size) => size,
    None => NonZeroUsize::MIN,
};

/// Executes whole Tasks. Shared by the worker; holds no per-task state.
#[derive(Clone)]
pub struct TaskProcessor {
    store: Arc<dyn RecordStore>,
    context: Arc<dyn ContextSource>,
    executor: BatchExecutor,
    schema: Arc<TableSchema>,
    batch_size: NonZeroUsize,
    max_retries: u32,
    persistence: RetryPolicy,
}

/// Bookkeeping of one round (first pass or retry).
#[derive(Default)]
struct RoundTally {
    unresolved: BTreeMap<RecordKey, RetryReason>,
    failures: Vec<BatchFailure>,
    completed: usize,
}

/// Bookkeeping across all rounds of one Task.
#[derive(Default)]
struct TaskTally {
    usage: Usage,
    calls: Vec<CallRecord>,
    failed_batches: usize,
    rejected_replies: usize,
}

impl TaskTally {
    fn round(&mut self, runs: Vec<BatchRun<BatchVerdict>>) -> RoundTally {
        let mut round = RoundTally::default();
        for run in runs {
            self.usage += run.usage;
            self.calls.extend(run.calls);
            match run.outcome {
                Ok(verdict) => {
                    round.completed += 1;
                    if verdict.rejected.is_some() {
                        self.rejected_replies += 1;
                    }
                    round.unresolved.extend(verdict.unresolved);
                }
                Err(failure) => {
                    // At-least-once: everything the batch carried goes back into the manifest.
                    round
                        .unresolved
                        .extend(run.expected.into_iter().map(|key| (key, RetryReason::Missing)));
                    round.failures.push(failure);
                }
            }
        }
        self.failed_batches += round.failures.len();
        round
    }
}

impl TaskProcessor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        context: Arc<dyn ContextSource>,
        executor: BatchExecutor,
        schema: Arc<TableSchema>,
    ) -> Self {
        Self {
            store,
            context,
            executor,
            schema,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: 2,
            persistence: RetryPolicy::default(),
        }
    }

    pub fn batch_size(mut self, batch_size: NonZeroUsize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn persistence_policy(mut self, policy: RetryPolicy) -> Self {
        self.persistence = policy;
        self
    }

    #[instrument(skip_all, fields(task_id = %task.id, logical_key = %task.logical_key))]
    pub async fn process(&self, task: &Task) -> Result<TaskReport, ProcessError> {
        let records = self.store.load(&task.source).await?;
        if task.kind == TaskKind::Single && records.len() != 1 {
            return Err(ProcessError::SingleArity(records.len()));
        }

        let batch_size = task.options.batch_size.unwrap_or(self.batch_size);
        let max_retries = task.options.max_retries.unwrap_or(self.max_retries);
        let mut job = partition(task.id, records, batch_size)?;

        if job.total() == 0 {
            info!("source resolved to no records");
            return Ok(self.report(task, &job, empty_merge(), TaskTally::default(), 0));
        }

        let context = Arc::new(
            self.context
                .snapshot(task)
                .await
                .map_err(|e| ProcessError::Context(e.to_string()))?,
        );

        let merger = Arc::new(Merger::new(Arc::clone(&self.schema)));
        let sink = Arc::new(MergeSink::new(
            Validator::new(Arc::clone(&self.schema)),
            Arc::clone(&merger),
        ));
        let mut tally = TaskTally::default();

        // first pass
        info!(
            records = job.total(),
            batches = job.batches.len(),
            batch_size = batch_size.get(),
            max_retries,
            "first pass started"
        );
        let requests: Vec<BatchRequest> = job
            .batches
            .iter()
            .map(|batch| BatchRequest {
                task_id: task.id,
                batch_index: batch.batch_index,
                round: 0,
                records: job.records_of(batch).to_vec(),
                context: Arc::clone(&context),
                retry: None,
            })
            .collect();
        for batch in &mut job.batches {
            batch.mark_dispatched();
        }
        let runs = self.executor.run(requests, Arc::clone(&sink)).await;
        let first = tally.round(runs);

        let failed_first: HashSet<usize> = first.failures.iter().map(|f| f.batch_index).collect();
        if first.completed == 0 {
            let failed = first.failures.len();
            if let Some(last) = first.failures.into_iter().last() {
                warn!(failed, "no batch of the first pass completed");
                return Err(ProcessError::NoBatchCompleted { failed, last });
            }
        }

        // retry rounds
        let coordinator = RetryCoordinator::new(max_retries);
        let mut unresolved = first.unresolved;
        let mut previous: Option<Arc<RetryManifest>> = None;
        let mut retry_rounds = 0;
        loop {
            let manifest = match coordinator.decide(previous.as_deref(), unresolved) {
                RetryDecision::Settled => break,
                RetryDecision::Exhausted(left) => {
                    warn!(unresolved = left.len(), max_retries, "retry budget exhausted");
                    break;
                }
                RetryDecision::Resubmit(manifest) => Arc::new(manifest),
            };

            retry_rounds = manifest.attempt_number();
            for index in coordinator.touched_batches(&job, &manifest) {
                job.batches[index].record_retry(max_retries);
            }
            info!(
                round = retry_rounds,
                identifiers = manifest.len(),
                "retry round started"
            );

            let requests = coordinator.requests(&job, &manifest, &context);
            let runs = self.executor.run(requests, Arc::clone(&sink)).await;
            unresolved = tally.round(runs).unresolved;
            previous = Some(manifest);
        }

        let merged = merger.finalize(&job, self.store.as_ref(), &self.persistence).await;
        let batches = settle_batches(&mut job, &merged, &failed_first);

        let mut report = self.report(task, &job, merged, tally, retry_rounds);
        report.batches = batches;
        info!(
            resolved = report.resolved,
            total = report.total,
            retry_rounds = report.retry_rounds,
            status = %report.status(),
            "task processed"
        );
        Ok(report)
    }

    fn report(
        &self,
        task: &Task,
        job: &BatchJob,
        merged: Merged,
        tally: TaskTally,
        retry_rounds: u32,
    ) -> TaskReport {
        TaskReport {
            task_id: task.id,
            header: self.schema.header().into_iter().map(String::from).collect(),
            total: job.total(),
            resolved: merged.rows.len(),
            rows: merged.rows,
            unresolved: merged.unresolved,
            repairs: merged.repairs,
            retry_rounds,
            failed_batches: tally.failed_batches,
            rejected_replies: tally.rejected_replies,
            noise: merged.noise,
            batches: Vec::new(),
            usage: tally.usage,
            calls: tally.calls,
        }
    }
}

fn empty_merge() -> Merged {
    Merged {
        rows: Vec::new(),
        unresolved: Vec::new(),
        repairs: Vec::new(),
        noise: Default::default(),
    }
}

/// Final status of every original batch, from what actually got resolved.
///
/// A batch counts as failed when its first-pass call failed and retries did
/// not recover all of its records, or when any of its records could not be
/// persisted (`UnresolvedCause::NotPersisted`).
fn settle_batches(
    job: &mut BatchJob,
    merged: &Merged,
    failed_first: &HashSet<usize>,
) -> Vec<BatchSummary> {
    let causes: HashMap<&str, &UnresolvedCause> = merged
        .unresolved
        .iter()
        .map(|u| (u.key.as_str(), &u.cause))
        .collect();
    let tallies: Vec<(usize, bool)> = job
        .batches
        .iter()
        .map(|batch| {
            let left: Vec<&UnresolvedCause> = job
                .records_of(batch)
                .iter()
                .filter_map(|r| causes.get(r.key.as_str()).copied())
                .collect();
            let not_persisted = left
                .iter()
                .any(|cause| matches!(cause, UnresolvedCause::NotPersisted(_)));
            (left.len(), not_persisted)
        })
        .collect();

    let mut summaries = Vec::with_capacity(job.batches.len());
    for (batch, (left, not_persisted)) in job.batches.iter_mut().zip(tallies) {
        let failed = not_persisted || (left > 0 && failed_first.contains(&batch.batch_index));
        batch.settle(left, failed);
        debug!(
            batch = batch.batch_index,
            status = ?batch.status,
            retries = batch.attempt_count,
            unresolved = left,
            "batch settled"
        );
        summaries.push(BatchSummary {
            batch_index: batch.batch_index,
            status: batch.status,
            retries: batch.attempt_count,
            unresolved: left,
        });
    }
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::fixtures::work_order_schema;
    use crate::domain::{
        BatchStatus, PersistenceError, Record, SourceRef, Submission, TaskId, TaskOptions,
        TaskStatus, TransportError,
    };
    use crate::impls::{InMemoryRecordStore, ScriptedInference, StaticContext};
    use crate::pipeline::render::RequestRenderer;
    use crate::ports::{
        Clock, ContextError, ContextSnapshot, InferenceReply, InferenceRequest, SystemClock,
        UlidGenerator,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use ulid::Ulid;

    const SOURCE: &str = "work-orders";
    const HEADER: &str = "id,site,description,label,remark";

    fn key(i: usize) -> String {
        format!("WO-{i:03}")
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                Record::new(
                    key(i),
                    [("site", "plant 1"), ("description", "pump leaks")],
                )
            })
            .collect()
    }

    fn row(id: &str) -> String {
        format!("{id},plant 1,pump leaks,quality,")
    }

    /// Well-formed table for every identifier of the request.
    fn full_table(request: &InferenceRequest) -> String {
        let mut text = format!("{HEADER}\n");
        for key in &request.expected {
            text.push_str(&row(key.as_str()));
            text.push('\n');
        }
        text
    }

    fn task(options: TaskOptions) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            Submission::batch("upload-1", SOURCE).with_options(options),
            chrono::Utc::now(),
        )
    }

    fn processor(client: Arc<ScriptedInference>, store: Arc<InMemoryRecordStore>) -> TaskProcessor {
        processor_with_context(client, store, Arc::new(StaticContext::new("Classify.", vec![])))
    }

    fn processor_with_context(
        client: Arc<ScriptedInference>,
        store: Arc<InMemoryRecordStore>,
        context: Arc<dyn ContextSource>,
    ) -> TaskProcessor {
        let schema = Arc::new(work_order_schema());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let executor = BatchExecutor::new(
            client,
            RequestRenderer::new(Arc::clone(&schema)),
            Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        )
        .workers(4)
        .retry_policy(RetryPolicy::new(
            Duration::from_millis(1),
            2.0,
            Duration::from_millis(4),
            2,
        ));
        TaskProcessor::new(store, context, executor, schema)
            .batch_size(NonZeroUsize::new(30).unwrap())
            .max_retries(2)
            .persistence_policy(RetryPolicy::new(
                Duration::from_millis(1),
                2.0,
                Duration::from_millis(4),
                3,
            ))
    }

    async fn seeded(n: usize) -> Arc<InMemoryRecordStore> {
        let store = Arc::new(InMemoryRecordStore::new());
        store.seed(SOURCE, records(n)).await;
        store
    }

    fn keys_in(report: &TaskReport) -> Vec<String> {
        report.rows.iter().map(|r| r.key.to_string()).collect()
    }

    #[tokio::test]
    async fn well_formed_replies_complete_without_retries() {
        let client = Arc::new(ScriptedInference::new(|req, _| Ok(InferenceReply::text(full_table(req)))));
        let store = seeded(45).await;
        let report = processor(Arc::clone(&client), Arc::clone(&store))
            .process(&task(TaskOptions::default()))
            .await
            .unwrap();

        assert_eq!(report.status(), TaskStatus::Completed);
        assert_eq!(report.resolved, 45);
        assert_eq!(report.retry_rounds, 0);
        assert_eq!(client.call_count().await, 2);
        assert_eq!(keys_in(&report), (0..45).map(key).collect::<Vec<_>>());
        assert_eq!(store.upsert_count("WO-044").await, 1);
    }

    /// 120 records, batches of 30. Batch 3 drops 5 identifiers and returns
    /// 2 rows with an unquoted comma in the description; one retry fixes it.
    #[tokio::test]
    async fn degraded_batch_is_repaired_and_retried_to_completion() {
        let missing: Vec<String> = (60..65).map(key).collect();
        let misaligned: Vec<String> = vec![key(70), key(71)];

        let client = Arc::new(ScriptedInference::new({
            let missing = missing.clone();
            let misaligned = misaligned.clone();
            move |req: &InferenceRequest, _: u32| {
                if req.round > 0 || req.batch_index != 2 {
                    return Ok(InferenceReply::text(full_table(req)));
                }
                let mut text = format!("```csv\n{HEADER}\n");
                for key in &req.expected {
                    let id = key.as_str();
                    if missing.iter().any(|m| m == id) {
                        continue;
                    }
                    if misaligned.iter().any(|m| m == id) {
                        text.push_str(&format!("{id},plant 1,pump leaks, badly,quality,\n"));
                    } else {
                        text.push_str(&row(id));
                        text.push('\n');
                    }
                }
                text.push_str("```\n");
                Ok(InferenceReply::text(text))
            }
        }));
        let store = seeded(120).await;
        let report = processor(Arc::clone(&client), Arc::clone(&store))
            .process(&task(TaskOptions::default()))
            .await
            .unwrap();

        assert_eq!(report.status(), TaskStatus::Completed);
        assert_eq!(report.total, 120);
        assert_eq!(report.resolved, 120);
        assert_eq!(report.retry_rounds, 1);
        assert_eq!(keys_in(&report), (0..120).map(key).collect::<Vec<_>>());

        // 4 first-pass calls plus one reduced retry call.
        let requests = client.requests().await;
        assert_eq!(requests.len(), 5);
        let retry: Vec<&InferenceRequest> = requests.iter().filter(|r| r.round == 1).collect();
        assert_eq!(retry.len(), 1);
        let retried: Vec<String> = retry[0].expected.iter().map(|k| k.to_string()).collect();
        assert_eq!(retried, missing);

        // Misaligned rows were repaired in place with the label kept in its column.
        for id in &misaligned {
            let row = report.row(id).unwrap();
            assert_eq!(row.get(2), Some("pump leaks,badly"));
            assert_eq!(row.get(3), Some("quality"));
            assert_eq!(report.rows.iter().find(|r| r.key.as_str() == id).unwrap().round, 0);
        }
        assert_eq!(report.repairs.len(), 2);
        assert_eq!(store.upsert_count(&key(62)).await, 1);
    }

    #[tokio::test]
    async fn identifier_never_resolved_degrades_task() {
        let client = Arc::new(ScriptedInference::new(|req, _| {
            let text = full_table(req)
                .lines()
                .filter(|line| !line.starts_with("WO-007,"))
                .collect::<Vec<_>>()
                .join("\n");
            Ok(InferenceReply::text(text))
        }));
        let store = seeded(10).await;
        let report = processor(Arc::clone(&client), store)
            .process(&task(TaskOptions::default()))
            .await
            .unwrap();

        assert_eq!(report.status(), TaskStatus::CompletedDegraded);
        assert_eq!(report.resolved, 9);
        assert_eq!(report.retry_rounds, 2);
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].key.as_str(), "WO-007");
        assert_eq!(report.unresolved[0].cause, UnresolvedCause::Missing);
        // first pass + 2 retry rounds
        assert_eq!(client.call_count().await, 3);
        assert_eq!(report.usage.requests, 3);
    }

    #[tokio::test]
    async fn every_first_pass_batch_failing_fails_the_task() {
        let client = Arc::new(ScriptedInference::new(|_, _| {
            Err(TransportError::Connection("refused".into()))
        }));
        let err = processor(client, seeded(40).await)
            .process(&task(TaskOptions::default()))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::NoBatchCompleted { failed: 2, .. }));
    }

    #[tokio::test]
    async fn failed_batch_is_recovered_by_retry() {
        let client = Arc::new(ScriptedInference::new(|req, _| {
            if req.round == 0 && req.batch_index == 1 {
                return Err(TransportError::Rejected("payload too large".into()));
            }
            Ok(InferenceReply::text(full_table(req)))
        }));
        let report = processor(client, seeded(60).await)
            .process(&task(TaskOptions::default()))
            .await
            .unwrap();

        assert_eq!(report.status(), TaskStatus::Completed);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.retry_rounds, 1);
    }

    #[tokio::test]
    async fn header_mismatch_retries_whole_batch() {
        let client = Arc::new(ScriptedInference::new(|req, _| {
            if req.round == 0 {
                let text = full_table(req).replacen(HEADER, "id,site,description,label,confidence", 1);
                return Ok(InferenceReply::text(text));
            }
            Ok(InferenceReply::text(full_table(req)))
        }));
        let report = processor(Arc::clone(&client), seeded(5).await)
            .process(&task(TaskOptions::default()))
            .await
            .unwrap();

        assert_eq!(report.status(), TaskStatus::Completed);
        let requests = client.requests().await;
        assert_eq!(requests[1].expected.len(), 5);
        assert!(report.rows.iter().all(|r| r.round == 1));
        assert_eq!(report.rejected_replies, 1);
        assert_eq!(report.batches[0].status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn task_options_override_defaults() {
        let client = Arc::new(ScriptedInference::new(|req, _| {
            Ok(InferenceReply::text(
                full_table(req)
                    .lines()
                    .filter(|l| !l.starts_with("WO-000,"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ))
        }));
        let options = TaskOptions::default()
            .with_batch_size(NonZeroUsize::new(2).unwrap())
            .with_max_retries(0);
        let report = processor(Arc::clone(&client), seeded(6).await)
            .process(&task(options))
            .await
            .unwrap();

        assert_eq!(client.call_count().await, 3);
        assert_eq!(report.retry_rounds, 0);
        assert!(report.is_degraded());
    }

    #[tokio::test]
    async fn persistent_upsert_failure_degrades_task() {
        let client = Arc::new(ScriptedInference::new(|req, _| Ok(InferenceReply::text(full_table(req)))));
        let store = seeded(3).await;
        store
            .fail_upserts("WO-001", vec![PersistenceError::Transient("lock".into()); 5])
            .await;
        let report = processor(client, Arc::clone(&store))
            .process(&task(TaskOptions::default()))
            .await
            .unwrap();

        assert_eq!(report.status(), TaskStatus::CompletedDegraded);
        assert!(matches!(report.unresolved[0].cause, UnresolvedCause::NotPersisted(_)));
        assert_eq!(store.upsert_count("WO-001").await, 0);
        assert_eq!(report.batches.len(), 1);
        assert_eq!(report.batches[0].status, BatchStatus::Failed);
        assert_eq!(report.batches[0].unresolved, 1);
    }

    #[tokio::test]
    async fn single_task_requires_one_record() {
        let client = Arc::new(ScriptedInference::new(|req, _| Ok(InferenceReply::text(full_table(req)))));
        let single = Task::new(
            TaskId::from_ulid(Ulid::new()),
            Submission::single("one", SOURCE),
            chrono::Utc::now(),
        );
        let err = processor(client, seeded(2).await)
            .process(&single)
            .await
            .unwrap_err();
        assert_eq!(err, ProcessError::SingleArity(2));
    }

    #[tokio::test]
    async fn unknown_source_is_a_process_error() {
        let client = Arc::new(ScriptedInference::new(|req, _| Ok(InferenceReply::text(full_table(req)))));
        let err = processor(client, Arc::new(InMemoryRecordStore::new()))
            .process(&task(TaskOptions::default()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProcessError::Source(PersistenceError::NotFound(SourceRef::new(SOURCE).to_string()))
        );
    }

    #[tokio::test]
    async fn empty_source_completes_immediately() {
        let client = Arc::new(ScriptedInference::new(|req, _| Ok(InferenceReply::text(full_table(req)))));
        let report = processor(Arc::clone(&client), seeded(0).await)
            .process(&task(TaskOptions::default()))
            .await
            .unwrap();
        assert_eq!(report.status(), TaskStatus::Completed);
        assert_eq!(report.total, 0);
        assert_eq!(client.call_count().await, 0);
    }

    struct BrokenContext;

    #[async_trait]
    impl ContextSource for BrokenContext {
        async fn snapshot(&self, _task: &Task) -> Result<ContextSnapshot, ContextError> {
            Err(ContextError("rules table unavailable".into()))
        }
    }

    #[tokio::test]
    async fn context_failure_is_a_process_error() {
        let client = Arc::new(ScriptedInference::new(|req, _| Ok(InferenceReply::text(full_table(req)))));
        let err = processor_with_context(client, seeded(3).await, Arc::new(BrokenContext))
            .process(&task(TaskOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Context(msg) if msg.contains("rules table")));
    }
}
