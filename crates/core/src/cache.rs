use crate::evaluator::EvaluationVerdict;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// The semantic question a verdict answers. Examples and the speaker label
/// only shape the prompt and are deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub utterance: String,
    pub phrase: String,
    pub definition: String,
    pub scenario: String,
}

/// Session-scoped memo of judgment results.
///
/// Overlapping evaluations read and write it concurrently, so the map sits
/// behind an async lock. It is never evicted; it dies with the session.
#[derive(Debug, Default)]
pub struct EvaluationCache {
    entries: RwLock<HashMap<CacheKey, EvaluationVerdict>>,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<EvaluationVerdict> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn insert(&self, key: CacheKey, verdict: EvaluationVerdict) {
        self.entries.write().await.insert(key, verdict);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
        info!("Evaluation cache cleared");
    }
}
