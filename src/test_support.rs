//! In-memory fakes for the external interfaces, analogous to the
//! teacher's `dashflow-testing` crate's `MockChatModel`/`MockTool`. Gated
//! behind the `testing` feature; never referenced from non-test code.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::generation::{GenerationRequest, GenerationResponse, Generator};
use crate::persistence::CheckpointStore;
use crate::retrieval::{RankedList, SearchBackend};
use crate::types::{PlanId, RetrievalResult, SimilarityMetric};

/// A [`SearchBackend`] that returns a fixed list of results for any query,
/// ignoring `top_k` beyond truncating to it.
pub struct FixedSearchBackend {
    results: Vec<RetrievalResult>,
}

impl FixedSearchBackend {
    /// Build a backend that always returns `document_ids`, scored by
    /// descending position.
    pub fn new(document_ids: &[&str]) -> Self {
        let results = document_ids
            .iter()
            .enumerate()
            .map(|(i, id)| RetrievalResult {
                document_id: (*id).to_string(),
                text: format!("fixture text for {id}"),
                score: 1.0 / (i as f64 + 1.0),
                metric: SimilarityMetric::Lexical,
                rank: i + 1,
            })
            .collect();
        Self { results }
    }
}

#[async_trait]
impl SearchBackend for FixedSearchBackend {
    async fn search(&self, _query: &str, top_k: usize) -> Result<RankedList> {
        Ok(RankedList {
            source: "fixture".to_string(),
            results: self.results.iter().take(top_k).cloned().collect(),
        })
    }
}

/// A [`Generator`] that echoes its prompt back with a fixed prefix,
/// useful for asserting a handler called generation at all without
/// depending on model output.
pub struct EchoGenerator {
    /// Text prepended to every response.
    pub prefix: String,
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self {
            prefix: "echo: ".to_string(),
        }
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        Ok(GenerationResponse {
            text: format!("{}{}", self.prefix, request.prompt),
        })
    }
}

/// An in-memory [`CheckpointStore`], keyed by plan id.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<PlanId, Vec<u8>>>,
}

impl InMemoryCheckpointStore {
    /// Build an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, plan_id: PlanId, wrapped_bytes: Vec<u8>) -> Result<()> {
        self.checkpoints.lock().insert(plan_id, wrapped_bytes);
        Ok(())
    }

    async fn load(&self, plan_id: PlanId) -> Result<Option<Vec<u8>>> {
        Ok(self.checkpoints.lock().get(&plan_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_backend_returns_configured_documents() {
        let backend = FixedSearchBackend::new(&["a", "b", "c"]);
        let list = backend.search("anything", 2).await.unwrap();
        assert_eq!(list.results.len(), 2);
        assert_eq!(list.results[0].document_id, "a");
    }

    #[tokio::test]
    async fn echo_generator_prefixes_prompt() {
        let generator = EchoGenerator::default();
        let response = generator
            .generate(GenerationRequest {
                prompt: "hello".to_string(),
                context: vec![],
            })
            .await
            .unwrap();
        assert_eq!(response.text, "echo: hello");
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryCheckpointStore::new();
        let plan_id = PlanId::new();
        assert!(store.load(plan_id).await.unwrap().is_none());
        store.save(plan_id, vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.load(plan_id).await.unwrap(), Some(vec![1, 2, 3]));
    }
}
