//! Ingestion: fetch → extract → chunk → embed → build namespace, at most once per document.

use crate::chunking::split_pages;
use crate::config::{ChunkingConfig, PipelineConfig};
use crate::embeddings::{embed_passages, EmbeddingProvider};
use crate::error::{PipelineError, Result};
use crate::extractor::PdfExtractor;
use crate::models::{IngestReport, Passage};
use crate::source::DocumentSource;
use crate::traits::VectorIndex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

/// One async mutex per document id, held across the existence check and the build.
///
/// Also remembers which documents this process has built, so a caller that
/// waited on the lock does not depend on the index reporting the new
/// namespace right away.
#[derive(Debug, Default)]
pub struct BuildLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    built: Mutex<HashSet<String>>,
}

impl BuildLocks {
    pub async fn acquire(&self, doc_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop locks nobody is holding or waiting on.
            locks.retain(|key, lock| key == doc_id || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(doc_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn mark_built(&self, doc_id: &str) {
        self.built
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(doc_id.to_string());
    }

    pub fn is_built(&self, doc_id: &str) -> bool {
        self.built
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(doc_id)
    }

    pub fn forget(&self, doc_id: &str) {
        self.built
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(doc_id);
    }

    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

pub struct Ingestor<E, V> {
    source: Arc<dyn DocumentSource>,
    extractor: Arc<dyn PdfExtractor>,
    embedder: Arc<E>,
    index: Arc<V>,
    chunking: ChunkingConfig,
    batch_size: usize,
    concurrency: usize,
    locks: BuildLocks,
}

impl<E, V> Ingestor<E, V>
where
    E: EmbeddingProvider,
    V: VectorIndex,
{
    pub fn new(
        config: &PipelineConfig,
        source: Arc<dyn DocumentSource>,
        extractor: Arc<dyn PdfExtractor>,
        embedder: Arc<E>,
        index: Arc<V>,
    ) -> Self {
        Self {
            source,
            extractor,
            embedder,
            index,
            chunking: config.chunking,
            batch_size: config.embedding.batch_size,
            concurrency: config.embedding.concurrency,
            locks: BuildLocks::default(),
        }
    }

    /// Builds the document's namespace unless it already exists.
    ///
    /// An existing namespace is reused as-is, even if the underlying PDF has
    /// changed since it was built; changing content needs a new `doc_id` or an
    /// explicit removal first.
    pub async fn ensure_namespace(
        &self,
        doc_id: &str,
        owner_id: &str,
    ) -> Result<IngestReport> {
        if doc_id.trim().is_empty() {
            return Err(PipelineError::validation(doc_id, "docId is empty"));
        }

        if self.locks.is_built(doc_id) || self.index.namespace_exists(doc_id).await? {
            debug!(doc_id, "namespace exists, reusing embeddings");
            return Ok(reused());
        }

        let _guard = self.locks.acquire(doc_id).await;
        if self.locks.is_built(doc_id) || self.index.namespace_exists(doc_id).await? {
            debug!(doc_id, "namespace was built by a concurrent request");
            return Ok(reused());
        }

        let passages = self.load_passages(doc_id, owner_id).await?;
        let texts: Vec<String> = passages.iter().map(|passage| passage.text.clone()).collect();
        let embeddings = embed_passages(
            self.embedder.as_ref(),
            doc_id,
            &texts,
            self.batch_size,
            self.concurrency,
        )
        .await?;

        self.index
            .build_namespace(doc_id, &passages, &embeddings)
            .await?;
        self.locks.mark_built(doc_id);

        info!(
            doc_id,
            passages = passages.len(),
            model = self.embedder.model(),
            "stored embeddings in namespace"
        );

        Ok(IngestReport {
            completed: true,
            built: true,
            passages: passages.len(),
        })
    }

    /// Deletes the namespace under the document's build lock.
    pub async fn remove(&self, doc_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(doc_id).await;
        self.index.delete_namespace(doc_id).await?;
        self.locks.forget(doc_id);
        Ok(())
    }

    /// Fetches, extracts and splits the document without touching the index.
    pub async fn load_passages(&self, doc_id: &str, owner_id: &str) -> Result<Vec<Passage>> {
        let bytes = self.source.fetch(doc_id, owner_id).await?;
        info!(doc_id, size = bytes.len(), checksum = %digest(&bytes), "loading pdf document");

        let pages = self.extractor.extract_pages(doc_id, &bytes)?;
        let passages = split_pages(doc_id, &pages, self.chunking);
        info!(doc_id, pages = pages.len(), passages = passages.len(), "split document");

        if passages.is_empty() {
            return Err(PipelineError::ingestion(
                doc_id,
                "document has no extractable text",
            ));
        }
        Ok(passages)
    }
}

fn reused() -> IngestReport {
    IngestReport {
        completed: true,
        built: false,
        passages: 0,
    }
}

pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
