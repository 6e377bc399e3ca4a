use crate::config::IndexConfig;
use crate::error::{status_fault, transport_fault, Fault, PipelineError};
use crate::models::{Passage, PassageMetadata, RetrievalHit, RetrievalResult};
use crate::traits::{ensure_namespace_key, validate_build, VectorIndex};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const UPSERT_BATCH: usize = 100;
const API_VERSION: &str = "2024-07";

/// Pinecone data-plane client. Each document is a namespace.
pub struct PineconeIndex {
    host: String,
    api_key: String,
    client: Client,
    dimensions: usize,
}

impl PineconeIndex {
    pub fn new(config: &IndexConfig, api_key: impl Into<String>) -> Result<Self, PipelineError> {
        let host = config.host.trim_end_matches('/').to_string();
        if host.is_empty() {
            return Err(PipelineError::index(
                "",
                Fault::Rejected,
                "pinecone index host is not configured",
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| PipelineError::index("", Fault::Unavailable, error.to_string()))?;

        Ok(Self {
            host,
            api_key: api_key.into(),
            client,
            dimensions: config.dimensions,
        })
    }

    async fn post(&self, doc_id: &str, path: &str, body: Value) -> Result<Value, PipelineError> {
        let response = self
            .client
            .post(format!("{}{}", self.host, path))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|error| PipelineError::index(doc_id, transport_fault(&error), error.to_string()))?;

        read_json(doc_id, path, response).await
    }
}

async fn read_json(doc_id: &str, path: &str, response: Response) -> Result<Value, PipelineError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PipelineError::index(
            doc_id,
            status_fault(status),
            format!("pinecone {path} returned {status}: {body}"),
        ));
    }

    response.json().await.map_err(|error| {
        PipelineError::index(doc_id, Fault::Malformed, format!("pinecone {path}: {error}"))
    })
}

fn namespace_in_stats(stats: &Value, doc_id: &str) -> bool {
    stats
        .pointer("/namespaces")
        .and_then(Value::as_object)
        .and_then(|namespaces| namespaces.get(doc_id))
        .map(|entry| {
            entry
                .pointer("/vectorCount")
                .and_then(Value::as_u64)
                .map_or(true, |count| count > 0)
        })
        .unwrap_or(false)
}

fn point(passage: &Passage, embedding: &[f32]) -> Value {
    json!({
        "id": passage.vector_id(),
        "values": embedding,
        "metadata": {
            "text": passage.text,
            "doc_id": passage.metadata.doc_id,
            "page": passage.metadata.page,
            "ordinal": passage.metadata.ordinal,
        },
    })
}

fn parse_matches(doc_id: &str, parsed: &Value) -> Result<RetrievalResult, PipelineError> {
    let matches = parsed
        .pointer("/matches")
        .and_then(Value::as_array)
        .ok_or_else(|| PipelineError::index(doc_id, Fault::Malformed, "query response has no matches"))?;

    let mut result = Vec::with_capacity(matches.len());
    for hit in matches {
        let score = hit.pointer("/score").and_then(Value::as_f64).ok_or_else(|| {
            PipelineError::index(doc_id, Fault::Malformed, "match is missing a score")
        })?;
        let text = hit
            .pointer("/metadata/text")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PipelineError::index(doc_id, Fault::Malformed, "match is missing passage text")
            })?
            .to_string();
        let page = metadata_number(doc_id, hit, "page")?;
        let ordinal = metadata_number(doc_id, hit, "ordinal")?;
        let page = u32::try_from(page).map_err(|_| {
            PipelineError::index(doc_id, Fault::Malformed, format!("page {page} is out of range"))
        })?;

        result.push(RetrievalHit {
            passage: Passage {
                text,
                metadata: PassageMetadata {
                    doc_id: doc_id.to_string(),
                    page,
                    ordinal,
                },
            },
            score: score as f32,
        });
    }

    result.sort_by(|left, right| right.score.total_cmp(&left.score));
    Ok(result)
}

/// Metadata numbers come back as JSON floats; they must be whole and non-negative.
fn metadata_number(doc_id: &str, hit: &Value, field: &str) -> Result<u64, PipelineError> {
    hit.pointer(&format!("/metadata/{field}"))
        .and_then(|value| {
            value.as_u64().or_else(|| {
                value
                    .as_f64()
                    .filter(|number| *number >= 0.0 && number.fract() == 0.0)
                    .map(|number| number as u64)
            })
        })
        .ok_or_else(|| {
            PipelineError::index(
                doc_id,
                Fault::Malformed,
                format!("match is missing passage {field}"),
            )
        })
}

impl PineconeIndex {
    async fn upsert_all(&self, doc_id: &str, points: &[Value]) -> Result<u64, PipelineError> {
        let mut upserted = 0u64;
        for batch in points.chunks(UPSERT_BATCH) {
            let response = self
                .post(
                    doc_id,
                    "/vectors/upsert",
                    json!({ "vectors": batch, "namespace": doc_id }),
                )
                .await?;
            upserted += response
                .pointer("/upsertedCount")
                .and_then(Value::as_u64)
                .unwrap_or(batch.len() as u64);
            debug!(doc_id, upserted, "upserted batch");
        }
        Ok(upserted)
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn namespace_exists(&self, doc_id: &str) -> Result<bool, PipelineError> {
        ensure_namespace_key(doc_id)?;
        let stats = self.post(doc_id, "/describe_index_stats", json!({})).await?;
        Ok(namespace_in_stats(&stats, doc_id))
    }

    async fn build_namespace(
        &self,
        doc_id: &str,
        passages: &[Passage],
        embeddings: &[Vec<f32>],
    ) -> Result<(), PipelineError> {
        validate_build(doc_id, passages, embeddings, self.dimensions)?;

        let points = passages
            .iter()
            .zip(embeddings.iter())
            .map(|(passage, embedding)| point(passage, embedding))
            .collect::<Vec<_>>();

        match self.upsert_all(doc_id, &points).await {
            Ok(upserted) => {
                info!(doc_id, vectors = upserted, "built pinecone namespace");
                Ok(())
            }
            Err(error) => {
                // A namespace holds every passage or none.
                if let Err(cleanup) = self.delete_namespace(doc_id).await {
                    warn!(doc_id, error = %cleanup, "could not discard partial namespace");
                }
                Err(error)
            }
        }
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
        if k == 0 {
            return Ok(Vec::new());
        }

        let parsed = self
            .post(
                doc_id,
                "/query",
                json!({
                    "namespace": doc_id,
                    "vector": query_vector,
                    "topK": k,
                    "includeMetadata": true,
                    "includeValues": false,
                }),
            )
            .await?;

        let mut hits = parse_matches(doc_id, &parsed)?;

        // Pinecone answers an unknown namespace with zero matches.
        if hits.is_empty() && !self.namespace_exists(doc_id).await? {
            return Err(PipelineError::index(
                doc_id,
                Fault::NotFound,
                "namespace does not exist",
            ));
        }

        hits.truncate(k);
        Ok(hits)
    }

    async fn delete_namespace(&self, doc_id: &str) -> Result<(), PipelineError> {
        ensure_namespace_key(doc_id)?;
        self.post(
            doc_id,
            "/vectors/delete",
            json!({ "deleteAll": true, "namespace": doc_id }),
        )
        .await?;
        info!(doc_id, "deleted pinecone namespace");
        Ok(())
    }
}
