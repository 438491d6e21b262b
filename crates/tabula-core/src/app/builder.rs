//! EngineBuilder - Engine の構築とワイヤリング
//!
//! # 方針
//! - ports（推論クライアント、RecordStore、schema）は必須、足りなければ build() で失敗（Fail-fast）
//! - 数値パラメータはすべて `EngineConfig` から
//! - ContextSource を渡さなければ `config.context` の固定ルールを使う

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::status::{QueueInfo, TaskStatusView};
use super::worker_loop::WorkerLoop;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::{Submission, SubmitError, TableSchema, TaskId, TaskReport};
use crate::impls::StaticContext;
use crate::pipeline::{BatchExecutor, RequestRenderer, TaskProcessor};
use crate::ports::{Clock, ContextSource, IdGenerator, InferenceClient, RecordStore, SystemClock, UlidGenerator};
use crate::queue::TaskQueue;

/// EngineBuilder は Engine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(EngineConfig::load()?)
///     .inference(client)
///     .store(store)
///     .schema(schema)
///     .build()?;
/// engine.start().await;
/// let task_id = engine.submit(Submission::batch("upload-42", "uploads/42")).await?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    inference: Option<Arc<dyn InferenceClient>>,
    store: Option<Arc<dyn RecordStore>>,
    schema: Option<TableSchema>,
    context: Option<Arc<dyn ContextSource>>,
    clock: Arc<dyn Clock>,
}

/// BuildError は Engine 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing ports: {0:?}. These must be provided before build().")]
    MissingPorts(Vec<&'static str>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inference: None,
            store: None,
            schema: None,
            context: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn inference(mut self, client: Arc<dyn InferenceClient>) -> Self {
        self.inference = Some(client);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn schema(mut self, schema: TableSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn context(mut self, context: Arc<dyn ContextSource>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// # 検証
    /// - config の値域
    /// - 必須 ports が全て揃っているか（不足分をまとめて返す）
    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;
        let batch_size = self.config.batch_size()?;

        let mut missing = Vec::new();
        if self.inference.is_none() {
            missing.push("inference");
        }
        if self.store.is_none() {
            missing.push("store");
        }
        if self.schema.is_none() {
            missing.push("schema");
        }
        let (Some(client), Some(store), Some(schema)) = (self.inference, self.store, self.schema)
        else {
            return Err(BuildError::MissingPorts(missing));
        };

        let context = self.context.unwrap_or_else(|| {
            Arc::new(StaticContext::new(
                self.config.context.instructions.clone(),
                self.config.context.rules.clone(),
            ))
        });
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&self.clock)));
        let schema = Arc::new(schema);

        let executor = BatchExecutor::new(
            client,
            RequestRenderer::new(Arc::clone(&schema)),
            Arc::clone(&ids),
            Arc::clone(&self.clock),
        )
        .workers(self.config.batch.workers)
        .call_timeout(self.config.inference.timeout())
        .retry_policy(self.config.inference.retry_policy())
        .rate_limit(self.config.inference.rate_limit());

        let processor = TaskProcessor::new(Arc::clone(&store), context, executor, schema)
            .batch_size(batch_size)
            .max_retries(self.config.retry.max_retries)
            .persistence_policy(self.config.persistence.retry_policy());

        let queue = TaskQueue::new(self.config.queue.capacity, store, ids, self.clock);

        info!(
            capacity = self.config.queue.capacity,
            batch_size = batch_size.get(),
            workers = self.config.batch.workers,
            max_retries = self.config.retry.max_retries,
            "engine built"
        );
        Ok(Engine {
            queue,
            processor: Arc::new(processor),
            worker: Mutex::new(None),
        })
    }
}

/// Engine は submit / status の表面と、1 つの worker を持つ
pub struct Engine {
    queue: TaskQueue,
    processor: Arc<TaskProcessor>,
    worker: Mutex<Option<WorkerLoop>>,
}

impl Engine {
    pub async fn submit(&self, submission: Submission) -> Result<TaskId, SubmitError> {
        self.queue.submit(submission).await
    }

    pub async fn status(&self, task_id: TaskId) -> Option<TaskStatusView> {
        self.queue.status(task_id).await
    }

    pub async fn status_by_key(&self, logical_key: &str) -> Option<TaskStatusView> {
        self.queue.status_by_key(logical_key).await
    }

    pub async fn report(&self, task_id: TaskId) -> Option<TaskReport> {
        self.queue.report(task_id).await
    }

    pub async fn info(&self) -> QueueInfo {
        self.queue.info().await
    }

    /// Start the worker. No-op while one is already running.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }
        *worker = Some(WorkerLoop::spawn(self.queue.clone(), Arc::clone(&self.processor)));
        info!("worker started");
    }

    /// Stop taking new tasks and wait for the in-flight one to finish.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown_and_join().await;
        }
    }
}
