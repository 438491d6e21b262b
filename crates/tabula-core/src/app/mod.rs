//! App - アプリケーション層
//!
//! queue と pipeline を組み合わせて、外から使える Engine を作ります。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: config と ports から Engine を構築（Fail-fast）
//! - **Engine**: submit / status / report の表面
//! - **WorkerLoop**: 単一コンシューマの実行ループ（claim→process→complete/fail）
//! - **status**: ステータスビュー

pub mod builder;
pub mod status;
pub mod worker_loop;

pub use self::builder::{BuildError, Engine, EngineBuilder};
pub use self::status::{QueueInfo, TaskStatusView};
pub use self::worker_loop::WorkerLoop;
