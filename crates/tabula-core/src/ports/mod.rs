//! Ports - 抽象化レイヤー
//!
//! 外部システム（推論サービス、永続ストア）への境界を trait で定義します。
//! 実装は `impls`（開発・テスト用）か、利用側のクレートに置きます。

pub mod clock;
pub mod context;
pub mod id_generator;
pub mod inference;
pub mod record_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::context::{ContextError, ContextSnapshot, ContextSource};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::inference::{InferenceClient, InferenceReply, InferenceRequest};
pub use self::record_store::{RecordStore, StatusProjection};
