//! ContextSource port - Task ごとの共有コンテキスト（分類ルールなど）
//!
//! processor は Task ごとに一度だけ snapshot を取り、`Arc` で各 worker に渡します。
//! snapshot は不変なので、worker 同士が状態を共有・変更することはありません。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Task;

/// Immutable contextual state rendered into every request of a Task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub instructions: String,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ContextError(pub String);

#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn snapshot(&self, task: &Task) -> Result<ContextSnapshot, ContextError>;
}
