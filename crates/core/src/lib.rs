pub mod chunking;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generator;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod source;
pub mod stores;
pub mod traits;

pub use chunking::{split_pages, split_text};
pub use config::{
    ChunkingConfig, EmbeddingConfig, GenerationConfig, IndexConfig, PipelineConfig,
    RetrievalConfig, RetryConfig, RetryPolicy, SourceConfig,
};
pub use context::assemble_context;
pub use embeddings::{
    embed_passages, embed_query, CharacterNgramEmbedder, EmbeddingProvider, HuggingFaceEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ConfigError, Fault, PipelineError};
pub use extractor::{normalize_page_text, LopdfExtractor, PageText, PdfExtractor};
pub use generator::{AnswerGenerator, ChatCompletionsGenerator};
pub use ingest::{BuildLocks, Ingestor};
pub use models::{
    Answer, AskResponse, ChatHistory, ChatRole, ChatTurn, IngestReport, Passage, PassageMetadata,
    RetrievalHit, RetrievalResult,
};
pub use orchestrator::{ChatPipeline, QueryStage};
pub use retry::{with_retry, Retrying};
pub use source::{DirectorySource, DocumentSource, HttpSource};
pub use stores::{InMemoryVectorIndex, PineconeIndex};
pub use traits::VectorIndex;
