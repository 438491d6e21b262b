//! InMemoryRecordStore - 開発・テスト用の永続ストア
//!
//! # 実装詳細
//! - tokio Mutex で状態全体を保護
//! - upsert は identifier をキーに上書き（冪等）
//! - テスト用に upsert 失敗を注入できる

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{PersistenceError, Record, RecordKey, SourceRef};
use crate::ports::{RecordStore, StatusProjection};

#[derive(Default)]
struct StoreState {
    /// source reference -> ordered keys
    sources: HashMap<String, Vec<RecordKey>>,
    records: HashMap<RecordKey, Record>,
    statuses: HashMap<String, StatusProjection>,
    upserts: HashMap<RecordKey, usize>,
    injected: HashMap<RecordKey, VecDeque<PersistenceError>>,
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    state: Mutex<StoreState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `records` under `source`, replacing any previous set.
    pub async fn seed(&self, source: impl Into<String>, records: Vec<Record>) {
        let mut state = self.state.lock().await;
        let keys = records.iter().map(|r| r.key.clone()).collect();
        for record in records {
            state.records.insert(record.key.clone(), record);
        }
        state.sources.insert(source.into(), keys);
    }

    /// Make the next upserts of `key` fail with `errors`, in order.
    pub async fn fail_upserts(&self, key: impl Into<RecordKey>, errors: Vec<PersistenceError>) {
        let mut state = self.state.lock().await;
        state.injected.entry(key.into()).or_default().extend(errors);
    }

    /// Successful upserts of `key` so far.
    pub async fn upsert_count(&self, key: &str) -> usize {
        let state = self.state.lock().await;
        state.upserts.get(key).copied().unwrap_or(0)
    }

    pub async fn record(&self, key: &str) -> Option<Record> {
        let state = self.state.lock().await;
        state.records.get(key).cloned()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load(&self, source: &SourceRef) -> Result<Vec<Record>, PersistenceError> {
        let state = self.state.lock().await;
        let keys = state
            .sources
            .get(source.as_str())
            .ok_or_else(|| PersistenceError::NotFound(source.to_string()))?;
        Ok(keys
            .iter()
            .filter_map(|key| state.records.get(key).cloned())
            .collect())
    }

    async fn read(&self, keys: &[RecordKey]) -> Result<Vec<Record>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| state.records.get(key).cloned())
            .collect())
    }

    async fn upsert(&self, record: &Record) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        if let Some(queue) = state.injected.get_mut(&record.key)
            && let Some(error) = queue.pop_front()
        {
            return Err(error);
        }
        state.records.insert(record.key.clone(), record.clone());
        *state.upserts.entry(record.key.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn put_status(
        &self,
        correlation_id: &str,
        projection: &StatusProjection,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state
            .statuses
            .insert(correlation_id.to_string(), projection.clone());
        Ok(())
    }

    async fn get_status(&self, correlation_id: &str) -> Result<Option<StatusProjection>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state.statuses.get(correlation_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fields, TaskId, TaskStatus};
    use chrono::Utc;
    use ulid::Ulid;

    fn records() -> Vec<Record> {
        vec![
            Record::new("B", [("text", "second")]),
            Record::new("A", [("text", "first")]),
        ]
    }

    #[tokio::test]
    async fn load_preserves_source_order() {
        let store = InMemoryRecordStore::new();
        store.seed("upload-1", records()).await;

        let loaded = store.load(&SourceRef::new("upload-1")).await.unwrap();
        let keys: Vec<&str> = loaded.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["B", "A"]);
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let store = InMemoryRecordStore::new();
        let err = store.load(&SourceRef::new("nope")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }

    #[tokio::test]
    async fn upsert_overwrites_by_key() {
        let store = InMemoryRecordStore::new();
        store.seed("s", records()).await;

        let mut first = Fields::new();
        first.insert("label".into(), "x".into());
        let mut second = Fields::new();
        second.insert("label".into(), "y".into());

        let record = Record::new("A", [("text", "first")]);
        store.upsert(&record.clone().with_outputs(first)).await.unwrap();
        store.upsert(&record.with_outputs(second)).await.unwrap();

        let stored = store.read(&[RecordKey::new("A"), RecordKey::new("Z")]).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].output_fields.as_ref().and_then(|f| f.get("label")).map(String::as_str),
            Some("y")
        );
        assert_eq!(store.upsert_count("A").await, 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = InMemoryRecordStore::new();
        store
            .fail_upserts("A", vec![PersistenceError::Transient("busy".into())])
            .await;

        let record = Record::new("A", [("text", "first")]);
        assert!(store.upsert(&record).await.is_err());
        assert!(store.upsert(&record).await.is_ok());
        assert_eq!(store.upsert_count("A").await, 1);
    }

    #[tokio::test]
    async fn status_projection_roundtrip() {
        let store = InMemoryRecordStore::new();
        let projection = StatusProjection {
            task_id: TaskId::from_ulid(Ulid::new()),
            status: TaskStatus::Pending,
            resolved_count: None,
            total_count: None,
            error: None,
            updated_at: Utc::now(),
        };
        store.put_status("upload-1", &projection).await.unwrap();

        assert_eq!(store.get_status("upload-1").await.unwrap(), Some(projection));
        assert_eq!(store.get_status("other").await.unwrap(), None);
    }
}
