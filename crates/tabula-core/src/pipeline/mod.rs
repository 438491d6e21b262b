//! Pipeline - 1 つの Task の中で起きること
//!
//! partition → executor（render / call / validate / merge）→ retry coordinator → finalize
//!
//! # 主要コンポーネント
//! - **partition**: Record 集合を連続した Batch に分ける
//! - **render**: Batch を推論リクエストのテキストにする
//! - **executor**: 並列数を制限して推論サービスを呼ぶ（timeout / backoff）
//! - **repair**: 応答テキストを schema に沿った表へ戻す
//! - **coordinator**: 未解決キーの manifest と再送
//! - **merge**: 順序付け・冪等 upsert
//! - **processor**: 上記を 1 Task 分つなぐ

pub mod coordinator;
pub mod executor;
pub mod merge;
pub mod partition;
pub mod processor;
pub mod render;
pub mod repair;

pub use self::coordinator::RetryCoordinator;
pub use self::executor::{BatchExecutor, BatchRequest, BatchRun, ResponseSink};
pub use self::merge::{BatchVerdict, MergeSink, Merged, Merger};
pub use self::partition::partition;
pub use self::processor::TaskProcessor;
pub use self::render::RequestRenderer;
pub use self::repair::{Noise, ValidationReport, Validator};
