//! Impls - ports の開発用・テスト用実装
//!
//! # 含まれる実装
//! - **InMemoryRecordStore**: 冪等 upsert とステータス投影を持つメモリ上のストア
//! - **ScriptedInference**: クロージャで応答を決める推論クライアント
//! - **StaticContext**: 固定ルールを返す ContextSource
//!
//! 本番用の実装（DB、HTTP クライアント）は利用側のクレートに置きます。

pub mod inmem_store;
pub mod scripted_inference;
pub mod static_context;

pub use self::inmem_store::InMemoryRecordStore;
pub use self::scripted_inference::ScriptedInference;
pub use self::static_context::StaticContext;
