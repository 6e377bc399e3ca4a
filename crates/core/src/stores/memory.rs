//! In-process vector index using cosine similarity.

use crate::error::{Fault, PipelineError};
use crate::models::{Passage, RetrievalHit, RetrievalResult};
use crate::traits::{ensure_namespace_key, validate_build, VectorIndex};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone)]
struct StoredVector {
    passage: Passage,
    vector: Vec<f32>,
}

/// Namespaces live behind a single `RwLock`; a build inserts the whole
/// namespace under the write lock, so readers never see a partial build.
#[derive(Debug)]
pub struct InMemoryVectorIndex {
    dimensions: usize,
    namespaces: RwLock<HashMap<String, Vec<StoredVector>>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub async fn namespace_len(&self, doc_id: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(doc_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn namespace_exists(&self, doc_id: &str) -> Result<bool, PipelineError> {
        ensure_namespace_key(doc_id)?;
        Ok(self.namespaces.read().await.contains_key(doc_id))
    }

    async fn build_namespace(
        &self,
        doc_id: &str,
        passages: &[Passage],
        embeddings: &[Vec<f32>],
    ) -> Result<(), PipelineError> {
        validate_build(doc_id, passages, embeddings, self.dimensions)?;

        let mut namespaces = self.namespaces.write().await;
        if namespaces.contains_key(doc_id) {
            return Err(PipelineError::index(
                doc_id,
                Fault::Rejected,
                "namespace is already built",
            ));
        }

        let entries = passages
            .iter()
            .zip(embeddings.iter())
            .map(|(passage, vector)| StoredVector {
                passage: passage.clone(),
                vector: vector.clone(),
            })
            .collect::<Vec<_>>();

        info!(doc_id, vectors = entries.len(), "built in-memory namespace");
        namespaces.insert(doc_id.to_string(), entries);
        Ok(())
    }

    async fn search(
        &self,
        doc_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<RetrievalResult, PipelineError> {
        ensure_namespace_key(doc_id)?;
        if query_vector.len() != self.dimensions {
            return Err(PipelineError::index(
                doc_id,
                Fault::Rejected,
                format!(
                    "query vector dim {} is not {}",
                    query_vector.len(),
                    self.dimensions
                ),
            ));
        }

        let namespaces = self.namespaces.read().await;
        let entries = namespaces.get(doc_id).ok_or_else(|| {
            PipelineError::index(doc_id, Fault::NotFound, "namespace does not exist")
        })?;

        let mut hits: Vec<RetrievalHit> = entries
            .iter()
            .map(|entry| RetrievalHit {
                passage: entry.passage.clone(),
                score: cosine_similarity(&entry.vector, query_vector),
            })
            .collect();

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.passage.metadata.ordinal.cmp(&right.passage.metadata.ordinal))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete_namespace(&self, doc_id: &str) -> Result<(), PipelineError> {
        ensure_namespace_key(doc_id)?;
        if self.namespaces.write().await.remove(doc_id).is_some() {
            info!(doc_id, "deleted in-memory namespace");
        }
        Ok(())
    }
}
