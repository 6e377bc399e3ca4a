use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use pdf_chat_core::{
    AnswerGenerator, ChatCompletionsGenerator, ChatHistory, ChatPipeline, CharacterNgramEmbedder,
    DirectorySource, DocumentSource, EmbeddingProvider, Fault, HttpSource, HuggingFaceEmbedder,
    InMemoryVectorIndex, LopdfExtractor, PineconeIndex, PipelineConfig, PipelineError, Retrying,
    VectorIndex,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Pipeline =
    ChatPipeline<Arc<dyn EmbeddingProvider>, Arc<dyn VectorIndex>, Arc<dyn AnswerGenerator>>;

#[derive(Parser)]
#[command(name = "pdf-chat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML pipeline configuration. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Vector index backend.
    #[arg(long, value_enum, default_value_t = IndexBackend::Memory, global = true)]
    index: IndexBackend,

    /// Embedding backend.
    #[arg(long, value_enum, default_value_t = EmbedderBackend::Hf, global = true)]
    embedder: EmbedderBackend,

    #[arg(long, env = "HUGGINGFACE_API_KEY", hide_env_values = true, global = true)]
    huggingface_api_key: Option<String>,

    #[arg(long, env = "PINECONE_API_KEY", hide_env_values = true, global = true)]
    pinecone_api_key: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    openai_api_key: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum IndexBackend {
    Memory,
    Pinecone,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderBackend {
    Hf,
    Local,
}

#[derive(Args)]
struct DocumentArgs {
    #[arg(long)]
    doc_id: String,

    #[arg(long, default_value = "local")]
    owner: String,

    /// Read the PDF from a local file.
    #[arg(long, conflicts_with = "url_template")]
    file: Option<PathBuf>,

    /// Download the PDF from a URL with `{owner}` and `{doc_id}` placeholders.
    #[arg(long)]
    url_template: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Build the document's namespace unless it already exists.
    Ingest {
        #[command(flatten)]
        document: DocumentArgs,
    },
    /// Ask one question about a document.
    Ask {
        #[command(flatten)]
        document: DocumentArgs,
        #[arg(long)]
        question: String,
    },
    /// Chat about a document, one question per stdin line.
    Chat {
        #[command(flatten)]
        document: DocumentArgs,
    },
    /// Delete the document's namespace.
    Remove {
        #[arg(long)]
        doc_id: String,
    },
}

/// Serves the bytes of one file for whatever document id is requested.
struct FileSource {
    path: PathBuf,
}

#[async_trait]
impl DocumentSource for FileSource {
    async fn fetch(&self, doc_id: &str, _owner_id: &str) -> Result<Vec<u8>, PipelineError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|error| {
            PipelineError::extraction(
                doc_id,
                Fault::NotFound,
                format!("cannot read {}: {error}", self.path.display()),
            )
        })?;
        if bytes.is_empty() {
            return Err(PipelineError::extraction(
                doc_id,
                Fault::NotFound,
                format!("{} is empty", self.path.display()),
            ));
        }
        Ok(bytes)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-chat boot"
    );

    match &cli.command {
        Command::Ingest { document } => {
            let pipeline = build_pipeline(&cli, &config, source_for(document, &config)?)?;
            let report = pipeline
                .ingest(&document.doc_id, &document.owner)
                .await
                .with_context(|| format!("ingesting {}", document.doc_id))?;

            if report.built {
                println!("{}: {} passages embedded", document.doc_id, report.passages);
            } else {
                println!("{}: namespace already exists, reusing it", document.doc_id);
            }
        }
        Command::Ask { document, question } => {
            let pipeline = build_pipeline(&cli, &config, source_for(document, &config)?)?;
            let response = pipeline
                .ask(&document.doc_id, &document.owner, question, &ChatHistory::new())
                .await;

            match (response.success, response.answer, response.error_message) {
                (true, Some(answer), _) => println!("{answer}"),
                (_, _, message) => bail!(message.unwrap_or_else(|| "no answer".to_string())),
            }
        }
        Command::Chat { document } => {
            let pipeline = build_pipeline(&cli, &config, source_for(document, &config)?)?;
            pipeline
                .ingest(&document.doc_id, &document.owner)
                .await
                .with_context(|| format!("preparing {}", document.doc_id))?;
            chat_loop(&pipeline, document).await?;
        }
        Command::Remove { doc_id } => {
            let source: Arc<dyn DocumentSource> = Arc::new(DirectorySource::new("."));
            let pipeline = build_pipeline(&cli, &config, source)?;
            pipeline
                .remove_document(doc_id)
                .await
                .with_context(|| format!("removing {doc_id}"))?;
            println!("{doc_id}: namespace removed");
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn source_for(
    document: &DocumentArgs,
    config: &PipelineConfig,
) -> anyhow::Result<Arc<dyn DocumentSource>> {
    match (&document.file, &document.url_template) {
        (Some(path), _) => Ok(Arc::new(FileSource { path: path.clone() })),
        (None, Some(template)) => {
            let timeout = Duration::from_secs(config.source.timeout_secs);
            Ok(Arc::new(HttpSource::new(template.clone(), timeout)?))
        }
        (None, None) => bail!("either --file or --url-template is required"),
    }
}

fn build_pipeline(
    cli: &Cli,
    config: &PipelineConfig,
    source: Arc<dyn DocumentSource>,
) -> anyhow::Result<Pipeline> {
    let retry = &config.retry;

    let embedder: Arc<dyn EmbeddingProvider> = match cli.embedder {
        EmbedderBackend::Hf => Arc::new(Retrying::new(
            HuggingFaceEmbedder::new(&config.embedding, cli.huggingface_api_key.clone())?,
            retry.embed,
            "embed",
        )),
        EmbedderBackend::Local => Arc::new(CharacterNgramEmbedder {
            dimensions: config.embedding.dimensions,
        }),
    };

    let index: Arc<dyn VectorIndex> = match cli.index {
        IndexBackend::Memory => {
            if matches!(cli.command, Command::Remove { .. }) {
                warn!("the memory index lives only for this process; nothing persisted to remove");
            }
            Arc::new(InMemoryVectorIndex::new(config.index.dimensions))
        }
        IndexBackend::Pinecone => {
            let api_key = cli
                .pinecone_api_key
                .clone()
                .ok_or_else(|| anyhow!("PINECONE_API_KEY is required for --index pinecone"))?;
            Arc::new(Retrying::new(
                PineconeIndex::new(&config.index, api_key)?,
                retry.index,
                "index",
            ))
        }
    };

    let api_key = cli.openai_api_key.clone().unwrap_or_default();
    let generator: Arc<dyn AnswerGenerator> = Arc::new(Retrying::new(
        ChatCompletionsGenerator::new(&config.generation, api_key)?,
        retry.generate,
        "generate",
    ));

    let extractor = Arc::new(LopdfExtractor::default());
    Ok(ChatPipeline::new(
        config, source, extractor, embedder, index, generator,
    )?)
}

async fn chat_loop(pipeline: &Pipeline, document: &DocumentArgs) -> anyhow::Result<()> {
    let mut history = ChatHistory::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }

        let response = pipeline
            .ask(&document.doc_id, &document.owner, question, &history)
            .await;
        match response.answer {
            Some(answer) if response.success => {
                stdout.write_all(format!("{answer}\n").as_bytes()).await?;
                history.record_exchange(question, &answer);
            }
            _ => {
                let message = response
                    .error_message
                    .unwrap_or_else(|| "no answer".to_string());
                stdout.write_all(format!("error: {message}\n").as_bytes()).await?;
            }
        }
    }

    info!(doc_id = %document.doc_id, turns = history.len(), "chat ended");
    Ok(())
}
