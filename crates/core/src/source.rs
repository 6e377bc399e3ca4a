//! Where ingestion reads raw PDF bytes from.

use crate::error::{status_fault, transport_fault, Fault, PipelineError};
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use url::{form_urlencoded, Url};

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, doc_id: &str, owner_id: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Reads `<root>/<owner>/<doc_id>.pdf`, falling back to `<root>/<doc_id>.pdf`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn candidates(&self, doc_id: &str, owner_id: &str) -> Vec<PathBuf> {
        let file_name = format!("{doc_id}.pdf");
        let mut paths = Vec::new();
        if !owner_id.is_empty() {
            paths.push(self.root.join(owner_id).join(&file_name));
        }
        paths.push(self.root.join(file_name));
        paths
    }
}

#[async_trait]
impl DocumentSource for DirectorySource {
    async fn fetch(&self, doc_id: &str, owner_id: &str) -> Result<Vec<u8>, PipelineError> {
        ensure_doc_id(doc_id)?;
        ensure_plain_name(doc_id, doc_id)?;
        ensure_plain_name(doc_id, owner_id)?;

        for path in self.candidates(doc_id, owner_id) {
            match tokio::fs::read(&path).await {
                Ok(bytes) if bytes.is_empty() => {
                    return Err(PipelineError::extraction(
                        doc_id,
                        Fault::NotFound,
                        format!("{} is empty", path.display()),
                    ));
                }
                Ok(bytes) => {
                    debug!(doc_id, path = %path.display(), size = bytes.len(), "read pdf");
                    return Ok(bytes);
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => {
                    return Err(PipelineError::extraction(
                        doc_id,
                        Fault::Unavailable,
                        format!("{}: {error}", path.display()),
                    ));
                }
            }
        }

        Err(PipelineError::extraction(
            doc_id,
            Fault::NotFound,
            format!("no pdf for document under {}", self.root.display()),
        ))
    }
}

/// Downloads from a URL template with `{owner}` and `{doc_id}` placeholders.
pub struct HttpSource {
    template: String,
    client: Client,
}

impl HttpSource {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Result<Self, PipelineError> {
        let template = template.into();
        let probe = template
            .replace("{owner}", "owner")
            .replace("{doc_id}", "doc");
        Url::parse(&probe).map_err(|error| {
            PipelineError::validation("", format!("invalid url template {template}: {error}"))
        })?;

        let client = Client::builder().timeout(timeout).build().map_err(|error| {
            PipelineError::extraction("", Fault::Unavailable, error.to_string())
        })?;

        Ok(Self { template, client })
    }

    /// Substitutes both ids as single, percent-encoded path segments.
    pub fn resolve(&self, doc_id: &str, owner_id: &str) -> Result<Url, PipelineError> {
        ensure_plain_name(doc_id, doc_id)?;
        ensure_plain_name(doc_id, owner_id)?;
        let raw = self
            .template
            .replace("{owner}", &encode_segment(owner_id))
            .replace("{doc_id}", &encode_segment(doc_id));
        Url::parse(&raw)
            .map_err(|error| PipelineError::validation(doc_id, format!("bad source url: {error}")))
    }
}

#[async_trait]
impl DocumentSource for HttpSource {
    async fn fetch(&self, doc_id: &str, owner_id: &str) -> Result<Vec<u8>, PipelineError> {
        ensure_doc_id(doc_id)?;
        let url = self.resolve(doc_id, owner_id)?;
        info!(doc_id, url = %url, "downloading pdf");

        let response = self.client.get(url.clone()).send().await.map_err(|error| {
            PipelineError::extraction(doc_id, transport_fault(&error), error.to_string())
        })?;

        if !response.status().is_success() {
            return Err(PipelineError::extraction(
                doc_id,
                status_fault(response.status()),
                format!("download from {url} returned {}", response.status()),
            ));
        }

        let bytes = response.bytes().await.map_err(|error| {
            PipelineError::extraction(doc_id, transport_fault(&error), error.to_string())
        })?;

        if bytes.is_empty() {
            return Err(PipelineError::extraction(
                doc_id,
                Fault::NotFound,
                format!("download from {url} returned no body"),
            ));
        }

        Ok(bytes.to_vec())
    }
}

fn ensure_doc_id(doc_id: &str) -> Result<(), PipelineError> {
    if doc_id.trim().is_empty() {
        return Err(PipelineError::validation(doc_id, "docId is empty"));
    }
    Ok(())
}

/// Ids become file or path segment names; `.` and `..` would walk the tree.
fn ensure_plain_name(doc_id: &str, name: &str) -> Result<(), PipelineError> {
    if matches!(name, "." | "..") || name.contains(['/', '\\']) {
        return Err(PipelineError::validation(
            doc_id,
            format!("{name:?} is not a valid document or owner id"),
        ));
    }
    Ok(())
}

fn encode_segment(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
