pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod stores;
pub mod traits;

pub use config::{
    CompletionSettings, EmbeddingSettings, PipelineConfig, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_MAX_CONTEXT_CHARS, DEFAULT_MAX_MATCHES, DEFAULT_MIN_TRUST_CHARS,
    DEFAULT_SIMILARITY_THRESHOLD,
};
pub use error::{CompletionError, ConfigError, EmbeddingError, PipelineError, StoreError};
pub use models::{ContentChunk, MatchSet, Question, Reply, ReplySource, StageKind};
pub use orchestrator::{
    build_context, build_system_prompt, AnswerPipeline, PipelinePhase, RetrievalState,
};
pub use providers::{openai::DEFAULT_OPENAI_ENDPOINT, OpenAiClient};
pub use stores::SupabaseStore;
pub use traits::{CompletionGenerator, EmbeddingGenerator, KnowledgeStore};
