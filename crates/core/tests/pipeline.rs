use async_trait::async_trait;
use pdf_chat_core::{
    AnswerGenerator, ChatHistory, ChatPipeline, ChatTurn, DocumentSource, EmbeddingProvider,
    Fault, InMemoryVectorIndex, Ingestor, PageText, Passage, PdfExtractor, PipelineConfig,
    PipelineError, RetrievalResult, RetryPolicy, Retrying, VectorIndex,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const STUB_ANSWER: &str = "Alpha is the first letter.";

#[derive(Default)]
struct Calls {
    fetch: AtomicUsize,
    embed: AtomicUsize,
    embedded_texts: AtomicUsize,
    exists: AtomicUsize,
    build: AtomicUsize,
    search: AtomicUsize,
    generate: AtomicUsize,
    rewrite: AtomicUsize,
}

impl Calls {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn network_calls(&self) -> usize {
        [
            &self.fetch,
            &self.embed,
            &self.exists,
            &self.build,
            &self.search,
            &self.generate,
            &self.rewrite,
        ]
        .iter()
        .map(|counter| Self::get(counter))
        .sum()
    }
}

struct StubSource {
    calls: Arc<Calls>,
}

#[async_trait]
impl DocumentSource for StubSource {
    async fn fetch(&self, _doc_id: &str, _owner_id: &str) -> Result<Vec<u8>, PipelineError> {
        self.calls.fetch.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(b"%PDF-stub".to_vec())
    }
}

struct StubExtractor {
    pages: Vec<&'static str>,
}

impl PdfExtractor for StubExtractor {
    fn extract_pages(&self, _doc_id: &str, _bytes: &[u8]) -> Result<Vec<PageText>, PipelineError> {
        Ok(self
            .pages
            .iter()
            .enumerate()
            .map(|(index, text)| PageText {
                number: index as u32 + 1,
                text: text.to_string(),
            })
            .collect())
    }
}

/// Points anything mentioning "Alpha" east and everything else north.
struct KeywordEmbedder {
    calls: Arc<Calls>,
    drop_last: bool,
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model(&self) -> &str {
        "keyword-stub"
    }

    fn dimensions(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        self.calls.embed.fetch_add(1, Ordering::SeqCst);
        self.calls
            .embedded_texts
            .fetch_add(texts.len(), Ordering::SeqCst);
        tokio::task::yield_now().await;

        let mut vectors: Vec<Vec<f32>> = texts
            .iter()
            .map(|text| {
                if text.contains("Alpha") {
                    vec![1.0, 0.0]
                } else {
                    vec![0.0, 1.0]
                }
            })
            .collect();
        if self.drop_last {
            vectors.pop();
        }
        Ok(vectors)
    }
}

struct CountingIndex {
    inner: InMemoryVectorIndex,
    calls: Arc<Calls>,
}

#[async_trait]
impl VectorIndex for CountingIndex {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn namespace_exists(&self, doc_id: &str) -> Result<bool, PipelineError> {
        self.calls.exists.fetch_add(1, Ordering::SeqCst);
        self.inner.namespace_exists(doc_id).await
    }

    async fn build_namespace(
        &self,
        doc_id: &str,
        passages: &[Passage],
        embeddings: &[Vec<f32>],
    ) -> Result<(), PipelineError> {
        self.calls.build.fetch_add(1, Ordering::SeqCst);
        self.inner.build_namespace(doc_id, passages, embeddings).await
    }

    async fn search(
        &self,
        doc_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<RetrievalResult, PipelineError> {
        self.calls.search.fetch_add(1, Ordering::SeqCst);
        self.inner.search(doc_id, query_vector, k).await
    }

    async fn delete_namespace(&self, doc_id: &str) -> Result<(), PipelineError> {
        self.inner.delete_namespace(doc_id).await
    }
}

struct StubGenerator {
    calls: Arc<Calls>,
    /// Number of leading `generate` calls that fail as unavailable.
    failures: AtomicUsize,
    seen_history: Mutex<Vec<usize>>,
    seen_context: Mutex<Vec<String>>,
}

impl StubGenerator {
    fn new(calls: Arc<Calls>, failures: usize) -> Self {
        Self {
            calls,
            failures: AtomicUsize::new(failures),
            seen_history: Mutex::new(Vec::new()),
            seen_context: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AnswerGenerator for StubGenerator {
    async fn generate(
        &self,
        context: &str,
        _question: &str,
        history: &[ChatTurn],
    ) -> Result<String, PipelineError> {
        self.calls.generate.fetch_add(1, Ordering::SeqCst);
        self.seen_history.lock().unwrap().push(history.len());
        self.seen_context.lock().unwrap().push(context.to_string());

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::generation("", Fault::Unavailable, "503"));
        }
        Ok(STUB_ANSWER.to_string())
    }

    async fn rewrite_query(
        &self,
        _question: &str,
        _history: &[ChatTurn],
    ) -> Result<String, PipelineError> {
        self.calls.rewrite.fetch_add(1, Ordering::SeqCst);
        Ok("Alpha".to_string())
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.chunking.max_chunk_chars = 20;
    config.chunking.overlap_chars = 0;
    config.embedding.dimensions = 2;
    config.index.dimensions = 2;
    config.retrieval.top_k = 1;
    config
}

struct Harness<G: AnswerGenerator> {
    calls: Arc<Calls>,
    pipeline: ChatPipeline<KeywordEmbedder, CountingIndex, G>,
}

fn harness_with<G: AnswerGenerator>(
    config: &PipelineConfig,
    drop_last: bool,
    make_generator: impl FnOnce(Arc<Calls>) -> G,
) -> Harness<G> {
    let calls = Arc::new(Calls::default());
    let pipeline = ChatPipeline::new(
        config,
        Arc::new(StubSource {
            calls: Arc::clone(&calls),
        }),
        Arc::new(StubExtractor {
            pages: vec!["Alpha Beta Gamma.", "Delta Epsilon."],
        }),
        KeywordEmbedder {
            calls: Arc::clone(&calls),
            drop_last,
        },
        CountingIndex {
            inner: InMemoryVectorIndex::new(2),
            calls: Arc::clone(&calls),
        },
        make_generator(Arc::clone(&calls)),
    )
    .expect("dimensions match");

    Harness { calls, pipeline }
}

fn harness(config: &PipelineConfig) -> Harness<StubGenerator> {
    harness_with(config, false, |calls| StubGenerator::new(calls, 0))
}

#[tokio::test]
async fn two_page_document_splits_into_one_passage_per_page() {
    let calls = Arc::new(Calls::default());
    let ingestor = Ingestor::new(
        &config(),
        Arc::new(StubSource {
            calls: Arc::clone(&calls),
        }),
        Arc::new(StubExtractor {
            pages: vec!["Alpha Beta Gamma.", "Delta Epsilon."],
        }),
        Arc::new(KeywordEmbedder {
            calls: Arc::clone(&calls),
            drop_last: false,
        }),
        Arc::new(InMemoryVectorIndex::new(2)),
    );

    let passages = ingestor
        .load_passages("doc-1", "owner")
        .await
        .expect("passages should load");
    let texts: Vec<&str> = passages.iter().map(|passage| passage.text.as_str()).collect();

    assert_eq!(texts, vec!["Alpha Beta Gamma.", "Delta Epsilon."]);
}

#[tokio::test]
async fn ask_returns_the_generated_answer_grounded_on_the_top_passage() {
    let harness = harness(&config());

    let answer = harness
        .pipeline
        .answer("doc-1", "owner", "What is Alpha?", &ChatHistory::new())
        .await
        .expect("question should be answered");

    assert_eq!(answer.answer, STUB_ANSWER);
    assert_eq!(answer.question, "What is Alpha?");
    assert_eq!(answer.context, "Alpha Beta Gamma.\n\n");

    let response = harness
        .pipeline
        .ask("doc-1", "owner", "What is Alpha?", &ChatHistory::new())
        .await;
    assert!(response.success);
    assert_eq!(response.answer.as_deref(), Some(STUB_ANSWER));
}

#[tokio::test]
async fn ingesting_twice_embeds_once() {
    let harness = harness(&config());

    let first = harness.pipeline.ingest("doc-1", "owner").await.expect("first ingest");
    let second = harness.pipeline.ingest("doc-1", "owner").await.expect("second ingest");

    assert!(first.completed && first.built);
    assert_eq!(first.passages, 2);
    assert!(second.completed && !second.built);
    assert_eq!(Calls::get(&harness.calls.embed), 1);
    assert_eq!(Calls::get(&harness.calls.build), 1);
    assert_eq!(Calls::get(&harness.calls.fetch), 1);
}

#[tokio::test]
async fn racing_ingestions_build_the_namespace_once() {
    let harness = harness(&config());

    let (left, right) = tokio::join!(
        harness.pipeline.ingest("doc-1", "owner"),
        harness.pipeline.ingest("doc-1", "owner"),
    );

    let built = [left.expect("left"), right.expect("right")]
        .iter()
        .filter(|report| report.built)
        .count();
    assert_eq!(built, 1);
    assert_eq!(Calls::get(&harness.calls.embed), 1);
    assert_eq!(Calls::get(&harness.calls.build), 1);
}

#[tokio::test]
async fn embedded_text_count_matches_non_empty_passages() {
    let calls = Arc::new(Calls::default());
    let pipeline = ChatPipeline::new(
        &config(),
        Arc::new(StubSource {
            calls: Arc::clone(&calls),
        }),
        Arc::new(StubExtractor {
            pages: vec!["Alpha Beta Gamma.", "", "   ", "Delta Epsilon."],
        }),
        KeywordEmbedder {
            calls: Arc::clone(&calls),
            drop_last: false,
        },
        InMemoryVectorIndex::new(2),
        StubGenerator::new(Arc::clone(&calls), 0),
    )
    .expect("dimensions match");

    let report = pipeline.ingest("doc-1", "owner").await.expect("ingest");

    assert_eq!(report.passages, 2);
    assert_eq!(Calls::get(&calls.embedded_texts), 2);
}

#[tokio::test]
async fn empty_inputs_fail_validation_before_any_call() {
    let harness = harness(&config());

    let empty_doc = harness
        .pipeline
        .answer("", "owner", "x", &ChatHistory::new())
        .await
        .unwrap_err();
    let empty_question = harness
        .pipeline
        .answer("d", "owner", "", &ChatHistory::new())
        .await
        .unwrap_err();

    assert!(matches!(empty_doc, PipelineError::Validation { .. }));
    assert!(matches!(empty_question, PipelineError::Validation { .. }));
    assert_eq!(harness.calls.network_calls(), 0);

    let response = harness
        .pipeline
        .ask("", "owner", "x", &ChatHistory::new())
        .await;
    assert!(!response.success);
    assert!(response.error_message.is_some());
    assert_eq!(harness.calls.network_calls(), 0);
}

#[tokio::test]
async fn mismatched_embedding_count_never_builds() {
    let harness = harness_with(&config(), true, |calls| StubGenerator::new(calls, 0));

    let error = harness.pipeline.ingest("doc-1", "owner").await.unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Embedding {
            fault: Fault::Malformed,
            ..
        }
    ));
    assert_eq!(error.doc_id(), "doc-1");
    assert_eq!(Calls::get(&harness.calls.build), 0);
}

#[tokio::test]
async fn history_triggers_a_query_rewrite() {
    let harness = harness(&config());
    let mut history = ChatHistory::new();
    history.record_exchange("Tell me about the document.", "It lists Greek letters.");

    let answer = harness
        .pipeline
        .answer("doc-1", "owner", "What about the first one?", &history)
        .await
        .expect("answer");

    assert_eq!(Calls::get(&harness.calls.rewrite), 1);
    assert_eq!(answer.context, "Alpha Beta Gamma.\n\n");
    assert_eq!(answer.question, "What about the first one?");
}

#[tokio::test]
async fn history_is_ignored_when_history_aware_mode_is_off() {
    let mut config = config();
    config.retrieval.history_aware = false;
    let generator = Arc::new(StubGenerator::new(Arc::new(Calls::default()), 0));
    let shared = Arc::clone(&generator);
    let harness = harness_with(&config, false, move |_| shared);

    let mut history = ChatHistory::new();
    history.record_exchange("Tell me about the document.", "It lists Greek letters.");

    harness
        .pipeline
        .answer("doc-1", "owner", "What is Alpha?", &history)
        .await
        .expect("answer");

    assert_eq!(Calls::get(&generator.calls.rewrite), 0);
    assert_eq!(*generator.seen_history.lock().unwrap(), vec![0]);
}

#[tokio::test]
async fn generation_failures_surface_without_retry() {
    let harness = harness_with(&config(), false, |calls| StubGenerator::new(calls, 1));

    let error = harness
        .pipeline
        .answer("doc-1", "owner", "What is Alpha?", &ChatHistory::new())
        .await
        .unwrap_err();

    assert_eq!(error.fault(), Some(Fault::Unavailable));
    assert_eq!(error.doc_id(), "doc-1");
    assert_eq!(Calls::get(&harness.calls.generate), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_decorator_recovers_transient_generation_failures() {
    let policy = RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 10,
        max_backoff_ms: 10,
    };
    let harness = harness_with(&config(), false, |calls| {
        Retrying::new(StubGenerator::new(calls, 1), policy, "generate")
    });

    let response = harness
        .pipeline
        .ask("doc-1", "owner", "What is Alpha?", &ChatHistory::new())
        .await;

    assert!(response.success);
    assert_eq!(Calls::get(&harness.calls.generate), 2);
}

#[tokio::test]
async fn removing_a_document_forces_a_rebuild() {
    let harness = harness(&config());

    harness.pipeline.ingest("doc-1", "owner").await.expect("ingest");
    harness.pipeline.remove_document("doc-1").await.expect("remove");
    let report = harness.pipeline.ingest("doc-1", "owner").await.expect("re-ingest");

    assert!(report.built);
    assert_eq!(Calls::get(&harness.calls.embed), 2);
}

#[tokio::test]
async fn mismatched_dimensions_are_rejected_at_construction() {
    let calls = Arc::new(Calls::default());
    let result = ChatPipeline::new(
        &config(),
        Arc::new(StubSource {
            calls: Arc::clone(&calls),
        }),
        Arc::new(StubExtractor { pages: vec![] }),
        KeywordEmbedder {
            calls: Arc::clone(&calls),
            drop_last: false,
        },
        InMemoryVectorIndex::new(3),
        StubGenerator::new(calls, 0),
    );

    assert!(matches!(result, Err(PipelineError::Validation { .. })));
}

/// Never reports a namespace, like an index whose stats trail its writes.
struct LaggingIndex {
    inner: InMemoryVectorIndex,
}

#[async_trait]
impl VectorIndex for LaggingIndex {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn namespace_exists(&self, _doc_id: &str) -> Result<bool, PipelineError> {
        Ok(false)
    }

    async fn build_namespace(
        &self,
        doc_id: &str,
        passages: &[Passage],
        embeddings: &[Vec<f32>],
    ) -> Result<(), PipelineError> {
        self.inner.build_namespace(doc_id, passages, embeddings).await
    }

    async fn search(
        &self,
        doc_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<RetrievalResult, PipelineError> {
        self.inner.search(doc_id, query_vector, k).await
    }

    async fn delete_namespace(&self, doc_id: &str) -> Result<(), PipelineError> {
        self.inner.delete_namespace(doc_id).await
    }
}

#[tokio::test]
async fn lagging_existence_checks_do_not_embed_twice() {
    let calls = Arc::new(Calls::default());
    let pipeline = ChatPipeline::new(
        &config(),
        Arc::new(StubSource {
            calls: Arc::clone(&calls),
        }),
        Arc::new(StubExtractor {
            pages: vec!["Alpha Beta Gamma.", "Delta Epsilon."],
        }),
        KeywordEmbedder {
            calls: Arc::clone(&calls),
            drop_last: false,
        },
        LaggingIndex {
            inner: InMemoryVectorIndex::new(2),
        },
        StubGenerator::new(Arc::clone(&calls), 0),
    )
    .expect("dimensions match");

    let (left, right) = tokio::join!(
        pipeline.ingest("doc-1", "owner"),
        pipeline.ingest("doc-1", "owner"),
    );
    left.expect("left");
    right.expect("right");
    let later = pipeline.ingest("doc-1", "owner").await.expect("later ingest");

    assert!(!later.built);
    assert_eq!(Calls::get(&calls.fetch), 1);
    assert_eq!(Calls::get(&calls.embed), 1);

    let response = pipeline
        .ask("doc-1", "owner", "What is Alpha?", &ChatHistory::new())
        .await;
    assert!(response.success);
    assert_eq!(Calls::get(&calls.embed), 2);

    pipeline.remove_document("doc-1").await.expect("remove");
    let rebuilt = pipeline.ingest("doc-1", "owner").await.expect("rebuild");
    assert!(rebuilt.built);
}

#[tokio::test]
async fn upstream_failures_become_unsuccessful_responses() {
    let harness = harness_with(&config(), false, |calls| StubGenerator::new(calls, 1));

    let response = harness
        .pipeline
        .ask("doc-1", "owner", "What is Alpha?", &ChatHistory::new())
        .await;

    assert!(!response.success);
    assert!(response.answer.is_none());
    let message = response.error_message.expect("failure carries a message");
    assert!(message.contains("generation error"), "{message}");
    assert!(message.contains("doc-1"), "{message}");
    assert_eq!(Calls::get(&harness.calls.generate), 1);
}
