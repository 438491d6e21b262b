//! ScriptedInference - 開発・テスト用の推論クライアント
//!
//! 応答はクロージャで決めます。クロージャは呼び出し番号（同じ batch / round
//! の中で 1 から数える）を受け取るので、「1 回目は timeout、2 回目は成功」
//! のようなシナリオを書けます。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::TransportError;
use crate::ports::{InferenceClient, InferenceReply, InferenceRequest};

type Responder =
    dyn Fn(&InferenceRequest, u32) -> Result<InferenceReply, TransportError> + Send + Sync;

pub struct ScriptedInference {
    responder: Box<Responder>,
    latency: Option<Duration>,
    log: Mutex<Vec<InferenceRequest>>,
    call_numbers: Mutex<HashMap<(usize, u32), u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedInference {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&InferenceRequest, u32) -> Result<InferenceReply, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            responder: Box::new(responder),
            latency: None,
            log: Mutex::new(Vec::new()),
            call_numbers: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every request received, in arrival order.
    pub async fn requests(&self) -> Vec<InferenceRequest> {
        self.log.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.log.lock().await.len()
    }

    /// Highest number of calls that were in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceReply, TransportError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_in_flight, Ordering::SeqCst);

        self.log.lock().await.push(request.clone());
        let call_number = {
            let mut numbers = self.call_numbers.lock().await;
            let n = numbers
                .entry((request.batch_index, request.round))
                .or_insert(0);
            *n += 1;
            *n
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let reply = (self.responder)(request, call_number);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use ulid::Ulid;

    fn request(batch_index: usize, round: u32) -> InferenceRequest {
        InferenceRequest {
            task_id: TaskId::from_ulid(Ulid::new()),
            batch_index,
            round,
            prompt: String::new(),
            expected: Vec::new(),
        }
    }

    #[tokio::test]
    async fn call_numbers_are_per_batch_and_round() {
        let client = ScriptedInference::new(|_, n| {
            if n == 1 {
                Err(TransportError::Connection("reset".into()))
            } else {
                Ok(InferenceReply::text(format!("call {n}")))
            }
        });

        assert!(client.complete(&request(0, 0)).await.is_err());
        assert_eq!(client.complete(&request(0, 0)).await.unwrap().text, "call 2");
        assert!(client.complete(&request(1, 0)).await.is_err());
        assert!(client.complete(&request(0, 1)).await.is_err());
        assert_eq!(client.call_count().await, 4);
    }
}
