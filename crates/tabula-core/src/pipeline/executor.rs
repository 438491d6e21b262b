//! Batch executor pool.
//!
//! # 実装詳細
//! - JoinSet で最大 `workers` 個の Batch を同時に実行（空いたら次を spawn）
//! - 1 回の呼び出しごとに `tokio::time::timeout` で上限時間を強制
//! - 通信系エラーは RetryPolicy の backoff で再試行し、上限で BatchFailure
//! - 応答は worker の中で `ResponseSink` に渡す（検証と mutex 付きの merge）
//! - 共有コンテキストは `Arc<ContextSnapshot>`（不変）でのみ受け取る

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info_span, warn};

use super::render::RequestRenderer;
use crate::domain::{
    BatchFailure, CallOutcome, CallRecord, Record, RecordKey, RetryManifest, TaskId,
    TransportError, Usage,
};
use crate::ports::{Clock, ContextSnapshot, IdGenerator, InferenceClient, InferenceReply, InferenceRequest};
use crate::queue::RetryPolicy;

type InferenceRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One unit of work for the pool: a batch (or retry chunk) in one round.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub task_id: TaskId,
    pub batch_index: usize,
    /// 0 = first pass, n = retry round n.
    pub round: u32,
    pub records: Vec<Record>,
    pub context: Arc<ContextSnapshot>,
    pub retry: Option<Arc<RetryManifest>>,
}

impl BatchRequest {
    pub fn keys(&self) -> Vec<RecordKey> {
        self.records.iter().map(|r| r.key.clone()).collect()
    }
}

/// Receives each successful reply inside the worker that got it.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    type Verdict: Send + 'static;

    async fn absorb(&self, request: &InferenceRequest, reply: InferenceReply) -> Self::Verdict;
}

/// What happened to one `BatchRequest`.
#[derive(Debug)]
pub struct BatchRun<V> {
    pub batch_index: usize,
    pub round: u32,
    pub expected: Vec<RecordKey>,
    pub outcome: Result<V, BatchFailure>,
    /// Usage of every call, failed ones included.
    pub usage: Usage,
    pub calls: Vec<CallRecord>,
}

/// Runs batch requests against the inference service with bounded parallelism.
#[derive(Clone)]
pub struct BatchExecutor {
    client: Arc<dyn InferenceClient>,
    renderer: RequestRenderer,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    workers: usize,
    call_timeout: Duration,
    policy: RetryPolicy,
    limiter: Option<Arc<InferenceRateLimiter>>,
}

impl BatchExecutor {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        renderer: RequestRenderer,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            renderer,
            ids,
            clock,
            workers: 4,
            call_timeout: Duration::from_secs(120),
            policy: RetryPolicy::default(),
            limiter: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cap outgoing calls per minute across all workers.
    pub fn rate_limit(mut self, per_minute: Option<NonZeroU32>) -> Self {
        self.limiter = per_minute.map(|n| Arc::new(RateLimiter::direct(Quota::per_minute(n))));
        self
    }

    /// Run every request, at most `workers` at a time.
    ///
    /// Results come back ordered by batch index, not by completion.
    pub async fn run<S>(&self, requests: Vec<BatchRequest>, sink: Arc<S>) -> Vec<BatchRun<S::Verdict>>
    where
        S: ResponseSink + 'static,
    {
        let mut pending = requests.into_iter();
        let mut join_set = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, (usize, u32, Vec<RecordKey>)> = HashMap::new();
        let mut runs = Vec::new();

        let spawn = |join_set: &mut JoinSet<BatchRun<S::Verdict>>,
                     in_flight: &mut HashMap<tokio::task::Id, (usize, u32, Vec<RecordKey>)>,
                     request: BatchRequest| {
            let identity = (request.batch_index, request.round, request.keys());
            let span = info_span!(
                "batch",
                task_id = %request.task_id,
                batch = request.batch_index,
                round = request.round,
                records = request.records.len(),
            );
            let executor = self.clone();
            let sink = Arc::clone(&sink);
            let handle = join_set.spawn(
                async move { executor.execute(request, sink.as_ref()).await }.instrument(span),
            );
            in_flight.insert(handle.id(), identity);
        };

        for request in pending.by_ref().take(self.workers) {
            spawn(&mut join_set, &mut in_flight, request);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((id, run)) => {
                    in_flight.remove(&id);
                    runs.push(run);
                }
                Err(join_err) => {
                    // A panicking sink or client must not take the other batches down.
                    if let Some((batch_index, round, expected)) = in_flight.remove(&join_err.id()) {
                        warn!(batch = batch_index, round, error = %join_err, "batch worker aborted");
                        runs.push(BatchRun {
                            batch_index,
                            round,
                            expected,
                            outcome: Err(BatchFailure {
                                batch_index,
                                round,
                                calls: 0,
                                last_error: TransportError::Rejected(format!(
                                    "batch worker aborted: {join_err}"
                                )),
                            }),
                            usage: Usage::default(),
                            calls: Vec::new(),
                        });
                    }
                }
            }

            if let Some(request) = pending.next() {
                spawn(&mut join_set, &mut in_flight, request);
            }
        }

        runs.sort_by_key(|run| (run.batch_index, run.round));
        runs
    }

    async fn execute<S>(&self, request: BatchRequest, sink: &S) -> BatchRun<S::Verdict>
    where
        S: ResponseSink + ?Sized,
    {
        let BatchRequest {
            task_id,
            batch_index,
            round,
            records,
            context,
            retry,
        } = request;
        let expected: Vec<RecordKey> = records.iter().map(|r| r.key.clone()).collect();
        let mut usage = Usage::default();
        let mut calls = Vec::new();

        let borrowed: Vec<&Record> = records.iter().collect();
        let rendered = self.renderer.render(
            task_id,
            batch_index,
            round,
            &borrowed,
            &context,
            retry.as_deref(),
        );
        let inference_request = match rendered {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to render batch request");
                return BatchRun {
                    batch_index,
                    round,
                    expected,
                    outcome: Err(BatchFailure {
                        batch_index,
                        round,
                        calls: 0,
                        last_error: TransportError::Rejected(format!("render failed: {e}")),
                    }),
                    usage,
                    calls,
                };
            }
        };

        let mut call_number = 0u32;
        loop {
            call_number += 1;
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            let started_at = self.clock.now();
            let result = match tokio::time::timeout(
                self.call_timeout,
                self.client.complete(&inference_request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.call_timeout)),
            };
            let completed_at = self.clock.now();

            let mut call = CallRecord {
                attempt_id: self.ids.generate_attempt_id(),
                task_id,
                batch_index,
                round,
                call_number,
                outcome: CallOutcome::Replied,
                usage: Usage::request_only(),
                started_at,
                completed_at,
            };

            match result {
                Ok(reply) => {
                    call.usage = reply.usage();
                    usage += call.usage;
                    calls.push(call);
                    debug!(call_number, tokens = usage.total_tokens, "reply received");

                    let verdict = sink.absorb(&inference_request, reply).await;
                    return BatchRun {
                        batch_index,
                        round,
                        expected,
                        outcome: Ok(verdict),
                        usage,
                        calls,
                    };
                }
                Err(error) => {
                    call.outcome = CallOutcome::TransportFailed(error.to_string());
                    usage += call.usage;
                    calls.push(call);

                    if !error.is_retryable() || !self.policy.allows_another(call_number) {
                        warn!(call_number, error = %error, "batch failed");
                        return BatchRun {
                            batch_index,
                            round,
                            expected,
                            outcome: Err(BatchFailure {
                                batch_index,
                                round,
                                calls: call_number,
                                last_error: error,
                            }),
                            usage,
                            calls,
                        };
                    }

                    let delay = self
                        .policy
                        .next_delay(call_number)
                        .max(error.retry_after().unwrap_or_default());
                    debug!(call_number, ?delay, error = %error, "transport error, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
