//! Per-stage retry with exponential backoff, applied as a decorator around
//! the embedding provider, the vector index and the answer generator.

use crate::config::RetryPolicy;
use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::generator::AnswerGenerator;
use crate::models::{ChatTurn, Passage, RetrievalResult};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is exhausted.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    stage: &'static str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    stage,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

pub struct Retrying<T> {
    inner: T,
    policy: RetryPolicy,
    stage: &'static str,
}

impl<T> Retrying<T> {
    pub fn new(inner: T, policy: RetryPolicy, stage: &'static str) -> Self {
        Self {
            inner,
            policy,
            stage,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: EmbeddingProvider> EmbeddingProvider for Retrying<T> {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        with_retry(self.policy, self.stage, || self.inner.embed(texts)).await
    }
}

#[async_trait]
impl<T: VectorIndex> VectorIndex for Retrying<T> {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn namespace_exists(&self, doc_id: &str) -> Result<bool> {
        with_retry(self.policy, self.stage, || self.inner.namespace_exists(doc_id)).await
    }

    async fn build_namespace(
        &self,
        doc_id: &str,
        passages: &[Passage],
        embeddings: &[Vec<f32>],
    ) -> Result<()> {
        with_retry(self.policy, self.stage, || {
            self.inner.build_namespace(doc_id, passages, embeddings)
        })
        .await
    }

    async fn search(
        &self,
        doc_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<RetrievalResult> {
        with_retry(self.policy, self.stage, || {
            self.inner.search(doc_id, query_vector, k)
        })
        .await
    }

    async fn delete_namespace(&self, doc_id: &str) -> Result<()> {
        with_retry(self.policy, self.stage, || self.inner.delete_namespace(doc_id)).await
    }
}

#[async_trait]
impl<T: AnswerGenerator> AnswerGenerator for Retrying<T> {
    async fn generate(
        &self,
        context: &str,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<String> {
        with_retry(self.policy, self.stage, || {
            self.inner.generate(context, question, history)
        })
        .await
    }

    async fn rewrite_query(
        &self,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<String> {
        with_retry(self.policy, self.stage, || {
            self.inner.rewrite_query(question, history)
        })
        .await
    }
}
