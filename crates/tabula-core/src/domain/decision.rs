//! Retry manifest and the decision taken after each round.
//!
//! 再試行は「未解決キーの manifest + 試行番号」の有限状態機械です。
//! 上限は manifest の構築時に強制されるため、呼び出し側の規約に頼りません。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::record::RecordKey;

/// Why an identifier is unresolved after a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    /// No row for the identifier (or its batch failed in transport).
    Missing,
    /// A row was present but could not be repaired.
    Malformed,
}

/// Identifiers to resubmit in retry round `attempt_number`.
///
/// A manifest with `attempt_number > max_retries` cannot be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryManifest {
    entries: BTreeMap<RecordKey, RetryReason>,
    attempt_number: u32,
    max_retries: u32,
}

impl RetryManifest {
    /// Manifest for the first retry round, if one is allowed and needed.
    pub fn first(entries: BTreeMap<RecordKey, RetryReason>, max_retries: u32) -> Option<Self> {
        Self::at(entries, 1, max_retries)
    }

    /// Manifest for the round after this one.
    pub fn next(&self, entries: BTreeMap<RecordKey, RetryReason>) -> Option<Self> {
        Self::at(entries, self.attempt_number + 1, self.max_retries)
    }

    fn at(
        entries: BTreeMap<RecordKey, RetryReason>,
        attempt_number: u32,
        max_retries: u32,
    ) -> Option<Self> {
        if entries.is_empty() || attempt_number > max_retries {
            return None;
        }
        Some(Self {
            entries,
            attempt_number,
            max_retries,
        })
    }

    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn reason(&self, key: &str) -> Option<RetryReason> {
        self.entries.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.entries.keys()
    }

    pub fn entries(&self) -> &BTreeMap<RecordKey, RetryReason> {
        &self.entries
    }
}

/// What to do after a round settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resubmit exactly the identifiers in the manifest.
    Resubmit(RetryManifest),

    /// Nothing left unresolved.
    Settled,

    /// Ceiling reached; these identifiers stay unresolved.
    Exhausted(BTreeMap<RecordKey, RetryReason>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unresolved(keys: &[&str]) -> BTreeMap<RecordKey, RetryReason> {
        keys.iter()
            .map(|k| (RecordKey::new(*k), RetryReason::Missing))
            .collect()
    }

    #[test]
    fn first_manifest_needs_entries_and_budget() {
        assert!(RetryManifest::first(unresolved(&[]), 3).is_none());
        assert!(RetryManifest::first(unresolved(&["A"]), 0).is_none());

        let manifest = RetryManifest::first(unresolved(&["A", "B"]), 3).unwrap();
        assert_eq!(manifest.attempt_number(), 1);
        assert_eq!(manifest.len(), 2);
        assert!(manifest.contains("A"));
        assert_eq!(manifest.reason("B"), Some(RetryReason::Missing));
    }

    #[test]
    fn ceiling_is_structural() {
        let first = RetryManifest::first(unresolved(&["A"]), 2).unwrap();
        let second = first.next(unresolved(&["A"])).unwrap();
        assert_eq!(second.attempt_number(), 2);
        assert!(second.next(unresolved(&["A"])).is_none());
    }
}
