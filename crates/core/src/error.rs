use std::fmt;
use thiserror::Error;

/// Coarse classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The upstream answered but had nothing for us (missing namespace, empty body, 404).
    NotFound,
    /// Network failure, timeout, 429 or 5xx.
    Unavailable,
    /// The upstream answered with a payload we could not use.
    Malformed,
    /// The upstream refused the request (4xx other than 404/429).
    Rejected,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Fault::NotFound => "not found",
            Fault::Unavailable => "unavailable",
            Fault::Malformed => "malformed response",
            Fault::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation error (doc {doc_id}): {reason}")]
    Validation { doc_id: String, reason: String },

    #[error("extraction error (doc {doc_id}, {fault}): {reason}")]
    Extraction {
        doc_id: String,
        fault: Fault,
        reason: String,
    },

    #[error("embedding error (doc {doc_id}, {fault}): {reason}")]
    Embedding {
        doc_id: String,
        fault: Fault,
        reason: String,
    },

    #[error("index error (doc {doc_id}, {fault}): {reason}")]
    Index {
        doc_id: String,
        fault: Fault,
        reason: String,
    },

    #[error("ingestion error (doc {doc_id}): {reason}")]
    Ingestion { doc_id: String, reason: String },

    #[error("generation error (doc {doc_id}, {fault}): {reason}")]
    Generation {
        doc_id: String,
        fault: Fault,
        reason: String,
    },
}

impl PipelineError {
    pub fn validation(doc_id: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            doc_id: doc_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn extraction(doc_id: &str, fault: Fault, reason: impl Into<String>) -> Self {
        Self::Extraction {
            doc_id: doc_id.to_string(),
            fault,
            reason: reason.into(),
        }
    }

    pub fn embedding(doc_id: &str, fault: Fault, reason: impl Into<String>) -> Self {
        Self::Embedding {
            doc_id: doc_id.to_string(),
            fault,
            reason: reason.into(),
        }
    }

    pub fn index(doc_id: &str, fault: Fault, reason: impl Into<String>) -> Self {
        Self::Index {
            doc_id: doc_id.to_string(),
            fault,
            reason: reason.into(),
        }
    }

    pub fn ingestion(doc_id: &str, reason: impl Into<String>) -> Self {
        Self::Ingestion {
            doc_id: doc_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn generation(doc_id: &str, fault: Fault, reason: impl Into<String>) -> Self {
        Self::Generation {
            doc_id: doc_id.to_string(),
            fault,
            reason: reason.into(),
        }
    }

    pub fn doc_id(&self) -> &str {
        match self {
            Self::Validation { doc_id, .. }
            | Self::Extraction { doc_id, .. }
            | Self::Embedding { doc_id, .. }
            | Self::Index { doc_id, .. }
            | Self::Ingestion { doc_id, .. }
            | Self::Generation { doc_id, .. } => doc_id,
        }
    }

    /// `None` for errors raised locally (validation, malformed passages).
    pub fn fault(&self) -> Option<Fault> {
        match self {
            Self::Extraction { fault, .. }
            | Self::Embedding { fault, .. }
            | Self::Index { fault, .. }
            | Self::Generation { fault, .. } => Some(*fault),
            Self::Validation { .. } | Self::Ingestion { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.fault() == Some(Fault::Unavailable)
    }

    /// Re-tags an error raised without document context (e.g. a query embedding).
    pub fn with_doc_id(mut self, id: &str) -> Self {
        match &mut self {
            Self::Validation { doc_id, .. }
            | Self::Extraction { doc_id, .. }
            | Self::Embedding { doc_id, .. }
            | Self::Index { doc_id, .. }
            | Self::Ingestion { doc_id, .. }
            | Self::Generation { doc_id, .. } => {
                if doc_id.is_empty() {
                    *doc_id = id.to_string();
                }
            }
        }
        self
    }
}

/// Maps a reqwest transport error onto a fault.
pub fn transport_fault(error: &reqwest::Error) -> Fault {
    if error.is_decode() {
        Fault::Malformed
    } else if let Some(status) = error.status() {
        status_fault(status)
    } else {
        Fault::Unavailable
    }
}

pub fn status_fault(status: reqwest::StatusCode) -> Fault {
    if status == reqwest::StatusCode::NOT_FOUND {
        Fault::NotFound
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Fault::Unavailable
    } else {
        Fault::Rejected
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(PipelineError::embedding("d", Fault::Unavailable, "down").is_retryable());
        assert!(!PipelineError::embedding("d", Fault::Malformed, "bad").is_retryable());
        assert!(!PipelineError::validation("d", "empty").is_retryable());
    }

    #[test]
    fn doc_id_is_filled_only_when_missing() {
        let error = PipelineError::index("", Fault::NotFound, "missing").with_doc_id("doc-7");
        assert_eq!(error.doc_id(), "doc-7");

        let error = PipelineError::index("doc-1", Fault::NotFound, "missing").with_doc_id("doc-7");
        assert_eq!(error.doc_id(), "doc-1");
    }

    #[test]
    fn status_codes_map_to_faults() {
        assert_eq!(status_fault(reqwest::StatusCode::NOT_FOUND), Fault::NotFound);
        assert_eq!(
            status_fault(reqwest::StatusCode::TOO_MANY_REQUESTS),
            Fault::Unavailable
        );
        assert_eq!(
            status_fault(reqwest::StatusCode::BAD_GATEWAY),
            Fault::Unavailable
        );
        assert_eq!(status_fault(reqwest::StatusCode::UNAUTHORIZED), Fault::Rejected);
    }
}
