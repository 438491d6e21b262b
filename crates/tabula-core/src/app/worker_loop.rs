//! WorkerLoop - 単一コンシューマのタスク実行ループ
//!
//! claim → process → complete / fail を繰り返します。
//!
//! - shutdown は新しい claim を止めるだけで、実行中の Task は最後まで走らせる
//! - Task 本体は別 task で spawn するので、panic しても worker は生き残り、その Task は failed になる

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::domain::ProcessError;
use crate::pipeline::TaskProcessor;
use crate::queue::TaskQueue;

/// Worker handle.
/// - `request_shutdown()` で新しい Task の取得を止める
/// - `shutdown_and_join()` で実行中の Task の終了まで待つ
pub struct WorkerLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerLoop {
    pub fn spawn(queue: TaskQueue, processor: Arc<TaskProcessor>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        queue.set_running(true);

        let join = tokio::spawn(async move {
            run(&queue, processor, &mut shutdown_rx).await;
            queue.set_running(false);
            info!("worker stopped");
        });

        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            error!(error = %e, "worker loop aborted");
        }
    }
}

async fn run(
    queue: &TaskQueue,
    processor: Arc<TaskProcessor>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // claim は待つので shutdown と競合させる（claim は cancel-safe）
        let lease = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            lease = queue.claim() => lease,
        };

        lease.publish_claimed().await;
        let task = lease.task().clone();
        let span = info_span!("task", task_id = %task.id, logical_key = %task.logical_key);
        let processor = Arc::clone(&processor);

        let handle = tokio::spawn(async move { processor.process(&task).await }.instrument(span));
        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(ProcessError::Aborted(join_error.to_string())),
        };

        match result {
            Ok(report) => {
                if let Err(e) = lease.complete(report).await {
                    warn!(error = %e, "failed to record task completion");
                }
            }
            Err(err) => {
                warn!(error = %err, kind = ?err.kind(), "task failed");
                if let Err(e) = lease.fail(&err).await {
                    warn!(error = %e, "failed to record task failure");
                }
            }
        }
    }
}
