use crate::config::{PipelineConfig, RetrievalConfig};
use crate::context::assemble_context;
use crate::embeddings::{embed_query, EmbeddingProvider};
use crate::error::{Fault, PipelineError, Result};
use crate::extractor::PdfExtractor;
use crate::generator::AnswerGenerator;
use crate::ingest::Ingestor;
use crate::models::{Answer, AskResponse, ChatHistory, ChatTurn, IngestReport};
use crate::source::DocumentSource;
use crate::traits::VectorIndex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Stages of one query execution, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Start,
    EnsureNamespace,
    RewriteQuery,
    EmbedQuery,
    Retrieve,
    AssembleContext,
    GenerateAnswer,
    Done,
    Error,
}

/// Conversational retrieval over per-document namespaces.
pub struct ChatPipeline<E, V, G>
where
    E: EmbeddingProvider,
    V: VectorIndex,
    G: AnswerGenerator,
{
    ingestor: Ingestor<E, V>,
    embedder: Arc<E>,
    index: Arc<V>,
    generator: G,
    retrieval: RetrievalConfig,
}

impl<E, V, G> ChatPipeline<E, V, G>
where
    E: EmbeddingProvider,
    V: VectorIndex,
    G: AnswerGenerator,
{
    pub fn new(
        config: &PipelineConfig,
        source: Arc<dyn DocumentSource>,
        extractor: Arc<dyn PdfExtractor>,
        embedder: E,
        index: V,
        generator: G,
    ) -> Result<Self> {
        if embedder.dimensions() != index.dimensions() {
            return Err(PipelineError::validation(
                "",
                format!(
                    "embedding dimension {} does not match index dimension {}",
                    embedder.dimensions(),
                    index.dimensions()
                ),
            ));
        }

        let embedder = Arc::new(embedder);
        let index = Arc::new(index);
        let ingestor = Ingestor::new(
            config,
            source,
            extractor,
            Arc::clone(&embedder),
            Arc::clone(&index),
        );

        Ok(Self {
            ingestor,
            embedder,
            index,
            generator,
            retrieval: config.retrieval.clone(),
        })
    }

    /// Ingestion trigger. Failures propagate so callers can withhold "ready to chat".
    pub async fn ingest(&self, doc_id: &str, owner_id: &str) -> Result<IngestReport> {
        self.ingestor
            .ensure_namespace(doc_id, owner_id)
            .await
            .inspect_err(|error| error!(doc_id, error = %error, "ingestion failed"))
    }

    /// Query trigger. Never fails: errors become `{success: false, error_message}`.
    pub async fn ask(
        &self,
        doc_id: &str,
        owner_id: &str,
        question: &str,
        history: &ChatHistory,
    ) -> AskResponse {
        match self.answer(doc_id, owner_id, question, history).await {
            Ok(answer) => AskResponse::answered(answer.answer),
            Err(error) => {
                warn!(doc_id, error = %error, "question could not be answered");
                AskResponse::failed(error.to_string())
            }
        }
    }

    /// Removes the document's namespace; the next query rebuilds it.
    pub async fn remove_document(&self, doc_id: &str) -> Result<()> {
        self.ingestor.remove(doc_id).await
    }

    pub fn should_rewrite(&self, history: &ChatHistory) -> bool {
        self.retrieval.history_aware
            && !history.is_empty()
            && history.human_turns() >= self.retrieval.rewrite_min_turns
    }

    /// Runs one query end to end and returns `{context, question, answer}`.
    ///
    /// Nothing here retries; wrap providers in [`crate::retry::Retrying`] for that.
    pub async fn answer(
        &self,
        doc_id: &str,
        owner_id: &str,
        question: &str,
        history: &ChatHistory,
    ) -> Result<Answer> {
        let mut stage = QueryStage::Start;
        let result = self
            .run(&mut stage, doc_id, owner_id, question, history)
            .await;

        if let Err(error) = &result {
            let failed_at = fail(&mut stage, doc_id);
            error!(doc_id, stage = ?failed_at, error = %error, "query failed");
        }
        result
    }

    async fn run(
        &self,
        stage: &mut QueryStage,
        doc_id: &str,
        owner_id: &str,
        question: &str,
        history: &ChatHistory,
    ) -> Result<Answer> {
        if doc_id.trim().is_empty() {
            return Err(PipelineError::validation(doc_id, "docId is empty"));
        }
        if question.trim().is_empty() {
            return Err(PipelineError::validation(doc_id, "question is empty"));
        }

        advance(stage, QueryStage::EnsureNamespace, doc_id);
        self.ingestor.ensure_namespace(doc_id, owner_id).await?;

        let search_query = if self.should_rewrite(history) {
            advance(stage, QueryStage::RewriteQuery, doc_id);
            let rewritten = self
                .generator
                .rewrite_query(question, history.turns())
                .await
                .map_err(|error| error.with_doc_id(doc_id))?;
            debug!(doc_id, rewritten = %rewritten, "rewrote question with history");
            rewritten
        } else {
            question.to_string()
        };

        advance(stage, QueryStage::EmbedQuery, doc_id);
        let query_vector = embed_query(self.embedder.as_ref(), doc_id, &search_query).await?;

        advance(stage, QueryStage::Retrieve, doc_id);
        let hits = self
            .index
            .search(doc_id, &query_vector, self.retrieval.top_k)
            .await?;
        if hits.is_empty() {
            return Err(PipelineError::index(
                doc_id,
                Fault::NotFound,
                "no passages matched the question",
            ));
        }

        advance(stage, QueryStage::AssembleContext, doc_id);
        let context = assemble_context(
            &hits,
            self.retrieval.max_context_chars,
            &self.retrieval.separator,
        );

        advance(stage, QueryStage::GenerateAnswer, doc_id);
        let turns: &[ChatTurn] = if self.retrieval.history_aware {
            history.turns()
        } else {
            &[]
        };
        let answer = self
            .generator
            .generate(&context, question, turns)
            .await
            .map_err(|error| error.with_doc_id(doc_id))?;
        if answer.trim().is_empty() {
            return Err(PipelineError::generation(
                doc_id,
                Fault::Malformed,
                "generator returned an empty answer",
            ));
        }

        advance(stage, QueryStage::Done, doc_id);
        info!(
            doc_id,
            hits = hits.len(),
            context_chars = context.chars().count(),
            "answered question"
        );

        Ok(Answer {
            context,
            question: question.to_string(),
            answer,
        })
    }
}

fn advance(stage: &mut QueryStage, next: QueryStage, doc_id: &str) {
    debug!(doc_id, from = ?*stage, to = ?next, "query stage");
    *stage = next;
}

/// Moves to `Error` and returns the stage that failed.
fn fail(stage: &mut QueryStage, doc_id: &str) -> QueryStage {
    let failed_at = *stage;
    advance(stage, QueryStage::Error, doc_id);
    failed_at
}
