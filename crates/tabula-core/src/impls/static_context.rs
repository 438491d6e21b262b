//! StaticContext - 設定ファイルのルールをそのまま返す ContextSource

use async_trait::async_trait;

use crate::domain::Task;
use crate::ports::{ContextError, ContextSnapshot, ContextSource};

#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    snapshot: ContextSnapshot,
}

impl StaticContext {
    pub fn new(instructions: impl Into<String>, rules: Vec<String>) -> Self {
        Self {
            snapshot: ContextSnapshot {
                instructions: instructions.into(),
                rules,
            },
        }
    }
}

#[async_trait]
impl ContextSource for StaticContext {
    async fn snapshot(&self, _task: &Task) -> Result<ContextSnapshot, ContextError> {
        Ok(self.snapshot.clone())
    }
}
