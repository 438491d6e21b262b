//! InferenceClient port - 外部推論サービス（信頼しない）
//!
//! サービスは描画済みのリクエストを受け取り、自由形式のテキストを返します。
//! 形の保証はありません。形の検証は `pipeline::repair` の責務です。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{RecordKey, TaskId, TransportError, Usage};

/// A rendered request for one batch in one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub task_id: TaskId,
    pub batch_index: usize,
    pub round: u32,
    pub prompt: String,
    /// Identifiers the reply is expected to contain, in request order.
    pub expected: Vec<RecordKey>,
}

/// Raw reply: free-form text plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceReply {
    pub text: String,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl InferenceReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn usage(&self) -> Usage {
        Usage::single(self.prompt_tokens, self.completion_tokens)
    }
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Send one request. Timeouts are enforced by the caller.
    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceReply, TransportError>;
}
