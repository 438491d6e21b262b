//! tabula-core
//!
//! Queue-driven engine that sends record batches to an inference service,
//! repairs the tabular text that comes back, retries what is still missing,
//! and merges everything into one ordered, idempotently persisted result.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, record, schema, batch, manifest, outcome, state, errors）
//! - **ports**: 抽象化レイヤー（InferenceClient, RecordStore, ContextSource, Clock, IdGenerator）
//! - **pipeline**: 1 Task の処理（partition, render, executor, repair, coordinator, merge）
//! - **queue**: 単一コンシューマの TaskQueue と backoff policy
//! - **app**: EngineBuilder / Engine / WorkerLoop / status
//! - **impls**: 開発・テスト用の ports 実装
//! - **config**, **telemetry**: 設定読み込みと tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod pipeline;
pub mod ports;
pub mod queue;
pub mod telemetry;

pub use app::{BuildError, Engine, EngineBuilder, QueueInfo, TaskStatusView};
pub use config::{ConfigError, EngineConfig};
pub use domain::{Submission, SubmitError, TaskId, TaskReport, TaskStatus};
