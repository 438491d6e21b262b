//! In-memory task queue.
//!
//! # 実装詳細
//! - 状態全体を tokio Mutex で保護し、待機は Notify で行う
//! - ready queue は TaskId だけを持ち、Task 本体は `tasks` が唯一の正本
//! - 同時に processing になれる Task は 1 つだけ（claim が拒否する）
//! - 遷移のたびに RecordStore::put_status() で永続的なステータス投影を書く
//!   （失敗はログに残すだけで、メモリ上の状態機械には影響しない）

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::QueueError;
use crate::app::status::{QueueInfo, TaskStatusView};
use crate::domain::{
    InvalidTransition, ProcessError, Submission, SubmitError, Task, TaskId, TaskReport,
    TaskStatus,
};
use crate::ports::{Clock, IdGenerator, RecordStore, StatusProjection};

/// In-memory queue state.
#[derive(Default)]
struct QueueState {
    /// All tasks (single source of truth).
    tasks: HashMap<TaskId, Task>,

    /// Latest task per logical key.
    by_key: HashMap<String, TaskId>,

    /// Pending tasks in submission order (TaskIds only).
    ready: VecDeque<TaskId>,

    /// The task currently processing, if any.
    current: Option<TaskId>,

    /// Reports of finished tasks.
    reports: HashMap<TaskId, TaskReport>,
}

impl QueueState {
    fn view(&self, id: TaskId) -> Option<TaskStatusView> {
        let task = self.tasks.get(&id)?;
        let queue_position = match task.status {
            TaskStatus::Pending => self.ready.iter().position(|queued| *queued == id),
            _ => None,
        };
        Some(TaskStatusView::new(task, queue_position, self.reports.get(&id)))
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
}

impl Shared {
    /// Write the durable projection. Failures never affect the queue.
    async fn publish(&self, logical_key: &str, projection: StatusProjection) {
        if let Err(e) = self.store.put_status(logical_key, &projection).await {
            warn!(
                logical_key,
                task_id = %projection.task_id,
                status = %projection.status,
                error = %e,
                "failed to write status projection"
            );
        }
    }
}

/// Explicitly constructed, single-consumer task queue.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<Shared>,
    ids: Arc<dyn IdGenerator>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(
        capacity: usize,
        store: Arc<dyn RecordStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                store,
                clock,
                running: AtomicBool::new(false),
            }),
            ids,
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a submission.
    ///
    /// Rejects when a non-terminal task with the same logical key exists, or
    /// when `capacity` tasks are already pending.
    pub async fn submit(&self, submission: Submission) -> Result<TaskId, SubmitError> {
        let now = self.shared.clock.now();
        let (task_id, projection, logical_key) = {
            let mut state = self.shared.state.lock().await;

            if let Some(existing) = state.by_key.get(&submission.logical_key).copied()
                && let Some(task) = state.tasks.get(&existing)
                && !task.status.is_terminal()
            {
                return Err(SubmitError::Duplicate {
                    logical_key: submission.logical_key,
                    existing,
                    status: task.status,
                });
            }
            if state.ready.len() >= self.capacity {
                return Err(SubmitError::QueueFull {
                    capacity: self.capacity,
                });
            }

            let task_id = self.ids.generate_task_id();
            let task = Task::new(task_id, submission, now);
            let logical_key = task.logical_key.clone();

            // Resubmission after a terminal state drops the cached result.
            if let Some(previous) = state.by_key.insert(logical_key.clone(), task_id) {
                state.reports.remove(&previous);
            }
            let projection = projection(&task, None, now);
            state.tasks.insert(task_id, task);
            state.ready.push_back(task_id);
            (task_id, projection, logical_key)
        };

        self.shared.notify.notify_one();
        info!(%task_id, logical_key, "task submitted");
        self.shared.publish(&logical_key, projection).await;
        Ok(task_id)
    }

    /// Wait for the next pending task and mark it processing.
    ///
    /// Never hands out a task while another one is processing.
    /// Cancel-safe: there is no await point between taking the task and
    /// returning the lease. The durable projection is written by
    /// `TaskLease::publish_claimed`.
    pub async fn claim(&self) -> TaskLease {
        loop {
            let claimed = {
                let mut state = self.shared.state.lock().await;
                if state.current.is_none()
                    && let Some(task_id) = state.ready.pop_front()
                {
                    let now = self.shared.clock.now();
                    let Some(task) = state.tasks.get_mut(&task_id) else {
                        continue;
                    };
                    if let Err(e) = task.start(now) {
                        warn!(%task_id, error = %e, "skipping task that cannot start");
                        continue;
                    }
                    let task = task.clone();
                    state.current = Some(task_id);
                    Some(task)
                } else {
                    None
                }
            };

            if let Some(task) = claimed {
                debug!(task_id = %task.id, "task claimed");
                return TaskLease {
                    task,
                    shared: Arc::clone(&self.shared),
                };
            }

            self.shared.notify.notified().await;
        }
    }

    pub async fn status(&self, task_id: TaskId) -> Option<TaskStatusView> {
        self.shared.state.lock().await.view(task_id)
    }

    /// Status of the latest task submitted under `logical_key`.
    pub async fn status_by_key(&self, logical_key: &str) -> Option<TaskStatusView> {
        let state = self.shared.state.lock().await;
        let task_id = *state.by_key.get(logical_key)?;
        state.view(task_id)
    }

    /// Cached report of a finished task.
    pub async fn report(&self, task_id: TaskId) -> Option<TaskReport> {
        self.shared.state.lock().await.reports.get(&task_id).cloned()
    }

    pub async fn info(&self) -> QueueInfo {
        let state = self.shared.state.lock().await;
        QueueInfo {
            queue_size: state.ready.len(),
            current_task: state.current,
            total_tasks: state.tasks.len(),
            processing: state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Processing)
                .count(),
            capacity: self.capacity,
            is_running: self.shared.running.load(Ordering::SeqCst),
        }
    }

    /// Recorded by the worker when it starts and stops.
    pub fn set_running(&self, running: bool) {
        self.shared.running.store(running, Ordering::SeqCst);
    }
}

/// The claimed task. The worker must `complete` or `fail` it.
pub struct TaskLease {
    task: Task,
    shared: Arc<Shared>,
}

impl TaskLease {
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Write the `processing` projection for the claimed task.
    pub async fn publish_claimed(&self) {
        let now = self.shared.clock.now();
        self.shared
            .publish(&self.task.logical_key, projection(&self.task, None, now))
            .await;
    }

    /// Processing -> Completed | CompletedDegraded, caching the report.
    pub async fn complete(self, report: TaskReport) -> Result<TaskStatus, QueueError> {
        let status = report.status();
        self.transition(|task, now| task.finish(status, now), Some(report))
            .await?;
        Ok(status)
    }

    /// Processing -> Failed.
    pub async fn fail(self, error: &ProcessError) -> Result<(), QueueError> {
        let message = error.to_string();
        self.transition(|task, now| task.fail(message, now), None)
            .await
    }

    async fn transition<F>(self, apply: F, report: Option<TaskReport>) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Task, DateTime<Utc>) -> Result<(), InvalidTransition>,
    {
        let task_id = self.task.id;
        let now = self.shared.clock.now();
        let (logical_key, projection) = {
            let mut state = self.shared.state.lock().await;
            if state.current == Some(task_id) {
                state.current = None;
            }
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(QueueError::UnknownTask(task_id))?;
            let applied = apply(task, now);
            let task = task.clone();
            if let Some(report) = report
                && applied.is_ok()
            {
                state.reports.insert(task_id, report);
            }
            applied?;
            let projection = projection(&task, state.reports.get(&task_id), now);
            (task.logical_key, projection)
        };

        self.shared.notify.notify_one();
        info!(%task_id, status = %projection.status, "task finished");
        self.shared.publish(&logical_key, projection).await;
        Ok(())
    }
}

fn projection(task: &Task, report: Option<&TaskReport>, now: DateTime<Utc>) -> StatusProjection {
    StatusProjection {
        task_id: task.id,
        status: task.status,
        resolved_count: report.map(|r| r.resolved),
        total_count: report.map(|r| r.total),
        error: task.error.clone(),
        updated_at: now,
    }
}
