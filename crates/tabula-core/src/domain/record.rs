//! Record: the atomic input/output unit keyed by a stable identifier.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Business identifier of a Record (e.g. a work order number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for RecordKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Named field values, keyed by column name.
pub type Fields = BTreeMap<String, String>;

/// A Record as read from the store.
///
/// `output_fields` stays `None` until the merger writes a resolved row back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub input_fields: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_fields: Option<Fields>,
}

impl Record {
    pub fn new<K, V>(key: impl Into<RecordKey>, inputs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            input_fields: inputs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            output_fields: None,
        }
    }

    pub fn with_outputs(mut self, outputs: Fields) -> Self {
        self.output_fields = Some(outputs);
        self
    }

    pub fn input(&self, column: &str) -> Option<&str> {
        self.input_fields.get(column).map(String::as_str)
    }

    pub fn is_resolved(&self) -> bool {
        self.output_fields.is_some()
    }
}
