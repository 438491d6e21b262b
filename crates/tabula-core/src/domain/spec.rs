//! Submission spec: what the gateway hands to `submit`.

use std::fmt;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// How the source resolves into work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Exactly one record.
    Single,
    /// A record set, partitioned into batches.
    Batch,
}

/// Opaque reference the record store resolves into a record set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(String);

impl SourceRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-task overrides of the engine defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<NonZeroUsize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TaskOptions {
    pub fn with_batch_size(mut self, batch_size: NonZeroUsize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A task submission.
///
/// `logical_key` is the caller's correlation id: at most one non-terminal Task
/// may exist per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub logical_key: String,
    pub kind: TaskKind,
    pub source: SourceRef,
    #[serde(default)]
    pub options: TaskOptions,
}

impl Submission {
    pub fn batch(logical_key: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            logical_key: logical_key.into(),
            kind: TaskKind::Batch,
            source: SourceRef::new(source),
            options: TaskOptions::default(),
        }
    }

    pub fn single(logical_key: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Single,
            ..Self::batch(logical_key, source)
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}
