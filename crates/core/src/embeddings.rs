use crate::config::EmbeddingConfig;
use crate::error::{status_fault, transport_fault, Fault, PipelineError};
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Maps texts to fixed-dimension vectors. Model identity and dimensionality
/// are fixed at construction.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per input, same order. Errors carry an empty `doc_id`;
    /// callers attach it.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

#[async_trait]
impl<T: EmbeddingProvider + ?Sized> EmbeddingProvider for Arc<T> {
    fn model(&self) -> &str {
        (**self).model()
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        (**self).embed(texts).await
    }
}

/// Local hashing embedder over character trigrams. Deterministic and offline.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn model(&self) -> &str {
        "char-trigram-hash"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Hugging Face inference feature-extraction endpoint.
pub struct HuggingFaceEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
}

impl HuggingFaceEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: Option<String>) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| PipelineError::embedding("", Fault::Unavailable, error.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    fn url(&self) -> String {
        format!("{}/{}", self.endpoint, self.model)
    }
}

#[async_trait]
impl EmbeddingProvider for HuggingFaceEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(model = %self.model, batch_size = texts.len(), "embedding batch");

        let mut request = self.client.post(self.url()).json(&json!({
            "inputs": texts,
            "options": { "wait_for_model": true },
        }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|error| {
            error!(model = %self.model, error = %error, "embedding request failed");
            PipelineError::embedding("", transport_fault(&error), error.to_string())
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::embedding(
                "",
                status_fault(status),
                format!("embedding endpoint returned {status}: {body}"),
            ));
        }

        let payload: Value = response.json().await.map_err(|error| {
            PipelineError::embedding("", Fault::Malformed, format!("invalid json: {error}"))
        })?;

        parse_vectors(&payload)
    }
}

fn parse_vectors(payload: &Value) -> Result<Vec<Vec<f32>>, PipelineError> {
    let rows = payload.as_array().ok_or_else(|| {
        PipelineError::embedding("", Fault::Malformed, "expected a json array of vectors")
    })?;

    rows.iter()
        .map(|row| {
            row.as_array()
                .and_then(|values| {
                    values
                        .iter()
                        .map(|value| value.as_f64().map(|number| number as f32))
                        .collect::<Option<Vec<f32>>>()
                })
                .ok_or_else(|| {
                    PipelineError::embedding("", Fault::Malformed, "vector is not a flat number array")
                })
        })
        .collect()
}

/// Verifies count and dimensionality of a provider response.
pub fn check_vectors(
    doc_id: &str,
    expected: usize,
    dimensions: usize,
    vectors: &[Vec<f32>],
) -> Result<(), PipelineError> {
    if vectors.len() != expected {
        return Err(PipelineError::embedding(
            doc_id,
            Fault::Malformed,
            format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                expected
            ),
        ));
    }
    if let Some(vector) = vectors.iter().find(|vector| vector.len() != dimensions) {
        return Err(PipelineError::embedding(
            doc_id,
            Fault::Malformed,
            format!("vector dimension {} != {}", vector.len(), dimensions),
        ));
    }
    Ok(())
}

/// Embeds passage texts in batches, up to `concurrency` batches in flight.
/// Output order matches input order.
pub async fn embed_passages<E>(
    provider: &E,
    doc_id: &str,
    texts: &[String],
    batch_size: usize,
    concurrency: usize,
) -> Result<Vec<Vec<f32>>, PipelineError>
where
    E: EmbeddingProvider + ?Sized,
{
    let batches: Vec<&[String]> = texts.chunks(batch_size.max(1)).collect();
    debug!(doc_id, batches = batches.len(), inputs = texts.len(), "embedding passages");

    let per_batch: Vec<Vec<Vec<f32>>> = stream::iter(batches)
        .map(|batch| async move {
            let vectors = provider
                .embed(batch)
                .await
                .map_err(|error| error.with_doc_id(doc_id))?;
            check_vectors(doc_id, batch.len(), provider.dimensions(), &vectors)?;
            Ok::<_, PipelineError>(vectors)
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;

    let vectors: Vec<Vec<f32>> = per_batch.into_iter().flatten().collect();
    check_vectors(doc_id, texts.len(), provider.dimensions(), &vectors)?;
    Ok(vectors)
}

pub async fn embed_query<E>(provider: &E, doc_id: &str, query: &str) -> Result<Vec<f32>, PipelineError>
where
    E: EmbeddingProvider + ?Sized,
{
    let vectors = provider
        .embed(&[query.to_string()])
        .await
        .map_err(|error| error.with_doc_id(doc_id))?;
    check_vectors(doc_id, 1, provider.dimensions(), &vectors)?;
    vectors.into_iter().next().ok_or_else(|| {
        PipelineError::embedding(doc_id, Fault::Malformed, "empty embedding response")
    })
}
