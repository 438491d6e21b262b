//! Result merger/reconciler.
//!
//! # 実装詳細
//! - 各 worker の検証結果は `tokio::sync::Mutex<MergeBuffer>` の下でだけ書き込む
//! - 競合時は prefer-last-attempt（後の round が勝つ、同じ round 内では後から来た方）
//! - finalize で元の Record 順に並べ、解決済みの Record を 1 回ずつ upsert する
//!   - Transient は backoff で再試行、Integrity は再試行しない
//!   - それでも書けなければ `NotPersisted` として未解決に数える

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::executor::ResponseSink;
use super::repair::{Noise, ValidationReport, Validator};
use crate::domain::{
    BatchJob, Fields, MergedRow, Record, RecordKey, RepairNote, RetryReason, Row, TableSchema,
    Unresolved, UnresolvedCause, ValidationError,
};
use crate::ports::{InferenceReply, InferenceRequest, RecordStore};
use crate::queue::RetryPolicy;

#[derive(Debug, Clone)]
struct Candidate {
    row: Row,
    round: u32,
}

#[derive(Debug, Default)]
struct MergeBuffer {
    rows: HashMap<RecordKey, Candidate>,
    /// Latest rejection reason (and its round) of identifiers that never resolved.
    malformed: HashMap<RecordKey, (String, u32)>,
    repairs: Vec<RepairNote>,
    noise: Noise,
}

/// Ordered, persisted result of one Task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub rows: Vec<MergedRow>,
    pub unresolved: Vec<Unresolved>,
    pub repairs: Vec<RepairNote>,
    pub noise: Noise,
}

/// Shared accumulation buffer of one Task.
#[derive(Debug)]
pub struct Merger {
    schema: Arc<TableSchema>,
    buffer: Mutex<MergeBuffer>,
}

impl Merger {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            buffer: Mutex::new(MergeBuffer::default()),
        }
    }

    /// Fold one validation report into the buffer.
    pub async fn absorb(&self, round: u32, report: &ValidationReport) {
        let mut buffer = self.buffer.lock().await;

        for key in report.result.keys() {
            let Some(row) = report.result.get(key.as_str()) else {
                continue;
            };
            let replaces = buffer
                .rows
                .get(key)
                .is_none_or(|existing| round >= existing.round);
            if replaces {
                buffer.rows.insert(
                    key.clone(),
                    Candidate {
                        row: row.clone(),
                        round,
                    },
                );
                buffer.malformed.remove(key);
            }
        }

        for (key, reason) in &report.malformed {
            let newer = buffer
                .malformed
                .get(key)
                .is_none_or(|(_, seen)| round >= *seen);
            if !buffer.rows.contains_key(key) && newer {
                buffer.malformed.insert(key.clone(), (reason.clone(), round));
            }
        }
        // A later round that got no row at all supersedes an older rejection.
        for key in &report.missing {
            if buffer
                .malformed
                .get(key)
                .is_some_and(|(_, seen)| round > *seen)
            {
                buffer.malformed.remove(key);
            }
        }

        buffer.repairs.extend(report.repairs.iter().map(|(key, kind)| RepairNote {
            key: key.clone(),
            kind: *kind,
            round,
        }));
        buffer.noise += report.noise;
    }

    /// Resolved identifiers so far.
    pub async fn resolved_count(&self) -> usize {
        self.buffer.lock().await.rows.len()
    }

    /// Order the buffer by `job`'s record order and upsert every resolved record once.
    pub async fn finalize(&self, job: &BatchJob, store: &dyn RecordStore, policy: &RetryPolicy) -> Merged {
        let (mut rows, malformed, repairs, noise) = {
            let mut buffer = self.buffer.lock().await;
            (
                std::mem::take(&mut buffer.rows),
                std::mem::take(&mut buffer.malformed),
                std::mem::take(&mut buffer.repairs),
                buffer.noise,
            )
        };

        let mut merged = Vec::with_capacity(rows.len());
        let mut unresolved = Vec::new();

        for record in job.records() {
            let Some(candidate) = rows.remove(&record.key) else {
                let cause = match malformed.get(&record.key) {
                    Some((reason, _)) => UnresolvedCause::Malformed(reason.clone()),
                    None => UnresolvedCause::Missing,
                };
                unresolved.push(Unresolved {
                    key: record.key.clone(),
                    cause,
                });
                continue;
            };

            let updated = record.clone().with_outputs(self.output_fields(&candidate.row));
            match upsert_with_retry(store, &updated, policy).await {
                Ok(()) => merged.push(MergedRow {
                    key: record.key.clone(),
                    row: candidate.row,
                    round: candidate.round,
                }),
                Err(reason) => unresolved.push(Unresolved {
                    key: record.key.clone(),
                    cause: UnresolvedCause::NotPersisted(reason),
                }),
            }
        }

        let mut repairs = repairs;
        repairs.sort_by_key(|note| (job.position_of(note.key.as_str()), note.round));

        Merged {
            rows: merged,
            unresolved,
            repairs,
            noise,
        }
    }

    fn output_fields(&self, row: &Row) -> Fields {
        self.schema
            .output_columns()
            .filter_map(|column| {
                row.get(column.position)
                    .map(|value| (column.name.clone(), value.to_string()))
            })
            .collect()
    }
}

async fn upsert_with_retry(store: &dyn RecordStore, record: &Record, policy: &RetryPolicy) -> Result<(), String> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match store.upsert(record).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && policy.allows_another(attempts) => {
                let delay = policy.next_delay(attempts);
                debug!(key = %record.key, attempts, ?delay, error = %e, "upsert failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(key = %record.key, attempts, error = %e, "giving up on upsert");
                return Err(e.to_string());
            }
        }
    }
}

/// Per-batch outcome the sink hands back to the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchVerdict {
    pub unresolved: BTreeMap<RecordKey, RetryReason>,
    /// Set when the whole reply was rejected.
    pub rejected: Option<ValidationError>,
}

/// Validates a reply and merges it, inside the worker that received it.
#[derive(Debug)]
pub struct MergeSink {
    validator: Validator,
    merger: Arc<Merger>,
}

impl MergeSink {
    pub fn new(validator: Validator, merger: Arc<Merger>) -> Self {
        Self { validator, merger }
    }
}

#[async_trait]
impl ResponseSink for MergeSink {
    type Verdict = BatchVerdict;

    async fn absorb(&self, request: &InferenceRequest, reply: InferenceReply) -> BatchVerdict {
        let (report, rejected) = match self.validator.validate(&reply.text, &request.expected) {
            Ok(report) => (report, None),
            Err(e) => {
                warn!(
                    batch = request.batch_index,
                    round = request.round,
                    error = %e,
                    "reply rejected"
                );
                (
                    ValidationReport::rejected(self.validator.schema(), &request.expected, &e),
                    Some(e),
                )
            }
        };

        self.merger.absorb(request.round, &report).await;

        debug!(
            batch = request.batch_index,
            round = request.round,
            resolved = report.result.len(),
            missing = report.missing.len(),
            malformed = report.malformed.len(),
            "reply merged"
        );
        BatchVerdict {
            unresolved: report.unresolved(),
            rejected,
        }
    }
}
