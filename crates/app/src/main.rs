mod server;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use site_chat_core::{
    AnswerPipeline, CompletionSettings, EmbeddingGenerator, EmbeddingSettings, KnowledgeStore,
    MatchSet, OpenAiClient, PipelineConfig, StageKind, SupabaseStore, DEFAULT_OPENAI_ENDPOINT,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "site-chat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Supabase project URL
    #[arg(long, env = "SUPABASE_URL")]
    supabase_url: String,

    /// Supabase service role key
    #[arg(long, env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    supabase_key: String,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_ENDPOINT)]
    openai_url: String,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_key: String,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args)]
struct PipelineArgs {
    /// Minimum cosine similarity for a vector match (inclusive)
    #[arg(long, env = "SIMILARITY_THRESHOLD", default_value_t = site_chat_core::DEFAULT_SIMILARITY_THRESHOLD)]
    similarity_threshold: f64,

    /// Matches requested from each search stage
    #[arg(long, env = "MATCH_COUNT", default_value_t = site_chat_core::DEFAULT_MAX_MATCHES)]
    match_count: usize,

    /// A chunk must be longer than this many characters to be returned verbatim
    #[arg(long, env = "MIN_TRUST_CHARS", default_value_t = site_chat_core::DEFAULT_MIN_TRUST_CHARS)]
    min_trust_chars: usize,

    /// Character budget for context passed to the completion model
    #[arg(long, env = "MAX_CONTEXT_CHARS", default_value_t = site_chat_core::DEFAULT_MAX_CONTEXT_CHARS)]
    max_context_chars: usize,

    #[arg(long, env = "LEXICAL_TIMEOUT_MS", default_value_t = 3_000)]
    lexical_timeout_ms: u64,

    #[arg(long, env = "EMBEDDING_TIMEOUT_MS", default_value_t = 5_000)]
    embedding_timeout_ms: u64,

    #[arg(long, env = "VECTOR_TIMEOUT_MS", default_value_t = 3_000)]
    vector_timeout_ms: u64,

    #[arg(long, env = "COMPLETION_TIMEOUT_MS", default_value_t = 20_000)]
    completion_timeout_ms: u64,

    /// Retrieval stages to run before the completion fallback
    #[arg(
        long,
        env = "PIPELINE_STAGES",
        value_delimiter = ',',
        default_values = ["lexical", "vector"]
    )]
    stages: Vec<StageKind>,

    /// Site name used in the assistant prompt
    #[arg(long, env = "SITE_NAME", default_value = "prosperonline.ca")]
    site_name: String,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = site_chat_core::DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    #[arg(long, env = "COMPLETION_MODEL", default_value = "gpt-4o-mini")]
    completion_model: String,

    #[arg(long, env = "COMPLETION_MAX_TOKENS", default_value_t = 512)]
    completion_max_tokens: u32,

    #[arg(long, env = "COMPLETION_TEMPERATURE", default_value_t = 0.2)]
    completion_temperature: f32,
}

impl PipelineArgs {
    fn to_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            similarity_threshold: self.similarity_threshold,
            max_matches: self.match_count,
            min_trust_chars: self.min_trust_chars,
            max_context_chars: self.max_context_chars,
            lexical_timeout: Duration::from_millis(self.lexical_timeout_ms),
            embedding_timeout: Duration::from_millis(self.embedding_timeout_ms),
            vector_timeout: Duration::from_millis(self.vector_timeout_ms),
            completion_timeout: Duration::from_millis(self.completion_timeout_ms),
            stages: self.stages.clone(),
            site_name: self.site_name.clone(),
            completion: CompletionSettings {
                model: self.completion_model.clone(),
                max_tokens: self.completion_max_tokens,
                temperature: self.completion_temperature,
            },
            embedding: EmbeddingSettings {
                model: self.embedding_model.clone(),
                dimensions: self.embedding_dimensions,
                ..defaults.embedding.clone()
            },
            ..defaults
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve the chat endpoint over HTTP.
    Serve {
        /// Listen address
        #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:5000")]
        bind: String,
        /// Origins allowed to call the chat endpoint ("*" for any)
        #[arg(
            long,
            env = "ALLOWED_ORIGINS",
            value_delimiter = ',',
            default_values = ["https://prosperonline.ca", "http://localhost:3000"]
        )]
        allowed_origins: Vec<String>,
    },
    /// Answer one question and print the reply.
    Ask {
        #[arg(long)]
        question: String,
    },
    /// Run both knowledge-store searches once and print what they return.
    Probe {
        #[arg(long)]
        query: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            return Err(error.into());
        }
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Arc::new(cli.pipeline.to_config());

    let provider = Arc::new(OpenAiClient::new(
        &cli.openai_url,
        &cli.openai_key,
        config.embedding.clone(),
        config.completion.clone(),
    )?);
    let store = SupabaseStore::new(&cli.supabase_url, &cli.supabase_key);
    let pipeline = Arc::new(AnswerPipeline::new(
        store,
        Arc::clone(&provider),
        Arc::clone(&provider),
        Arc::clone(&config),
    )?);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        stages = ?config.stages,
        threshold = config.similarity_threshold,
        "site-chat boot"
    );

    match cli.command {
        Command::Serve {
            bind,
            allowed_origins,
        } => {
            server::serve(pipeline, &bind, &allowed_origins).await?;
        }
        Command::Ask { question } => {
            let reply = pipeline.answer(&question).await?;
            println!("source: {:?}", reply.source);
            if let Some(chunk_id) = &reply.chunk_id {
                println!("chunk: {chunk_id}");
            }
            println!("{}", reply.text);
        }
        Command::Probe { query } => {
            let settings = pipeline.config();
            let limit = settings.max_matches;
            match pipeline.store().lexical_search(&query, limit).await {
                Ok(matches) => print_matches("lexical", &matches),
                Err(error) => warn!(%error, "lexical search failed"),
            }

            match provider.embed(&query).await {
                Ok(embedding) => {
                    println!("embedding: dimensions={}", embedding.len());
                    match pipeline
                        .store()
                        .vector_search(&embedding, settings.similarity_threshold, limit)
                        .await
                    {
                        Ok(matches) => print_matches("vector", &matches),
                        Err(error) => warn!(%error, "vector search failed"),
                    }
                }
                Err(error) => warn!(%error, "embedding failed"),
            }
        }
    }

    Ok(())
}

fn print_matches(stage: &str, matches: &MatchSet) {
    println!("{stage}: {} match(es)", matches.len());
    for chunk in matches.iter() {
        let similarity = chunk
            .similarity
            .map(|score| format!("{score:.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "[{stage}] id={} similarity={} title={}",
            chunk.id, similarity, chunk.title
        );
        println!("  content:\n{}", chunk.body);
    }
}
