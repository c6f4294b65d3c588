use crate::error::ConfigError;
use crate::models::StageKind;
use std::time::Duration;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;
pub const DEFAULT_MAX_MATCHES: usize = 5;
pub const DEFAULT_MIN_TRUST_CHARS: usize = 40;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 4_000;
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1_536;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSettings {
    pub model: String,
    pub dimensions: usize,
    /// Provider context limit, compared against a chars/4 estimate.
    pub max_input_tokens: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            max_input_tokens: 8_191,
        }
    }
}

/// Process-wide pipeline settings. Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Inclusive lower bound on vector similarity.
    pub similarity_threshold: f64,
    pub max_matches: usize,
    /// A chunk body must be strictly longer than this (trimmed, in chars)
    /// to be returned verbatim.
    pub min_trust_chars: usize,
    pub max_context_chars: usize,
    pub lexical_timeout: Duration,
    pub embedding_timeout: Duration,
    pub vector_timeout: Duration,
    pub completion_timeout: Duration,
    /// Retrieval stages in priority order. Completion always runs last.
    pub stages: Vec<StageKind>,
    pub site_name: String,
    pub empty_completion_reply: String,
    pub completion: CompletionSettings,
    pub embedding: EmbeddingSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            max_matches: DEFAULT_MAX_MATCHES,
            min_trust_chars: DEFAULT_MIN_TRUST_CHARS,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            lexical_timeout: Duration::from_secs(3),
            embedding_timeout: Duration::from_secs(5),
            vector_timeout: Duration::from_secs(3),
            completion_timeout: Duration::from_secs(20),
            stages: vec![StageKind::Lexical, StageKind::Vector],
            site_name: "prosperonline.ca".to_string(),
            empty_completion_reply: "Sorry, I couldn't generate a reply.".to_string(),
            completion: CompletionSettings::default(),
            embedding: EmbeddingSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(invalid(
                "similarity_threshold",
                format!("{} is outside [0, 1]", self.similarity_threshold),
            ));
        }
        if self.max_matches == 0 {
            return Err(invalid("max_matches", "must be at least 1".to_string()));
        }
        if self.max_context_chars == 0 {
            return Err(invalid("max_context_chars", "must be at least 1".to_string()));
        }

        let timeouts = [
            ("lexical_timeout", self.lexical_timeout),
            ("embedding_timeout", self.embedding_timeout),
            ("vector_timeout", self.vector_timeout),
            ("completion_timeout", self.completion_timeout),
        ];
        for (field, value) in timeouts {
            if value.is_zero() {
                return Err(invalid(field, "must be greater than zero".to_string()));
            }
        }

        for (index, stage) in self.stages.iter().enumerate() {
            if self.stages[..index].contains(stage) {
                return Err(invalid("stages", format!("stage `{stage}` listed twice")));
            }
        }
        if let [StageKind::Vector, StageKind::Lexical, ..] = self.stages.as_slice() {
            return Err(invalid(
                "stages",
                "lexical search must run before vector search".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.completion.temperature) {
            return Err(invalid(
                "completion.temperature",
                format!("{} is outside [0, 2]", self.completion.temperature),
            ));
        }
        if self.completion.max_tokens == 0 {
            return Err(invalid("completion.max_tokens", "must be at least 1".to_string()));
        }
        if self.completion.model.trim().is_empty() {
            return Err(invalid("completion.model", "must not be empty".to_string()));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(invalid("embedding.model", "must not be empty".to_string()));
        }
        if self.embedding.dimensions == 0 {
            return Err(invalid("embedding.dimensions", "must be at least 1".to_string()));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::InvalidValue { field, reason }
}
