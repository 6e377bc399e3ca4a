use crate::error::{Fault, PipelineError};
use crate::models::{Passage, RetrievalResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Namespaced nearest-neighbour store, one namespace per document.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn namespace_exists(&self, doc_id: &str) -> Result<bool, PipelineError>;

    /// Creates the namespace and stores every (vector, passage) pair.
    async fn build_namespace(
        &self,
        doc_id: &str,
        passages: &[Passage],
        embeddings: &[Vec<f32>],
    ) -> Result<(), PipelineError>;

    /// Up to `k` hits from `doc_id`'s namespace, highest similarity first.
    async fn search(
        &self,
        doc_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<RetrievalResult, PipelineError>;

    async fn delete_namespace(&self, doc_id: &str) -> Result<(), PipelineError>;
}

#[async_trait]
impl<T: VectorIndex + ?Sized> VectorIndex for Arc<T> {
    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn namespace_exists(&self, doc_id: &str) -> Result<bool, PipelineError> {
        (**self).namespace_exists(doc_id).await
    }

    async fn build_namespace(
        &self,
        doc_id: &str,
        passages: &[Passage],
        embeddings: &[Vec<f32>],
    ) -> Result<(), PipelineError> {
        (**self).build_namespace(doc_id, passages, embeddings).await
    }

    async fn search(
        &self,
        doc_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<RetrievalResult, PipelineError> {
        (**self).search(doc_id, query_vector, k).await
    }

    async fn delete_namespace(&self, doc_id: &str) -> Result<(), PipelineError> {
        (**self).delete_namespace(doc_id).await
    }
}

pub fn ensure_namespace_key(doc_id: &str) -> Result<(), PipelineError> {
    if doc_id.trim().is_empty() {
        return Err(PipelineError::index(
            doc_id,
            Fault::Rejected,
            "no namespace value provided",
        ));
    }
    Ok(())
}

/// Checks shared by every backend before anything is written.
pub fn validate_build(
    doc_id: &str,
    passages: &[Passage],
    embeddings: &[Vec<f32>],
    dimensions: usize,
) -> Result<(), PipelineError> {
    ensure_namespace_key(doc_id)?;

    if passages.is_empty() {
        return Err(PipelineError::ingestion(doc_id, "no passages to index"));
    }

    if let Some(passage) = passages.iter().find(|passage| passage.text.trim().is_empty()) {
        return Err(PipelineError::ingestion(
            doc_id,
            format!("passage {} has empty text", passage.metadata.ordinal),
        ));
    }

    if embeddings.len() != passages.len() {
        return Err(PipelineError::ingestion(
            doc_id,
            format!(
                "embedding count {} doesn't match passage count {}",
                embeddings.len(),
                passages.len()
            ),
        ));
    }

    if let Some(embedding) = embeddings.iter().find(|vector| vector.len() != dimensions) {
        return Err(PipelineError::ingestion(
            doc_id,
            format!("embedding dimension {} != {}", embedding.len(), dimensions),
        ));
    }

    Ok(())
}
