use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by [`crate::AnswerPipeline`] to its caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("question is empty")]
    InvalidInput,

    #[error("completion upstream unavailable: {0}")]
    UpstreamUnavailable(#[source] CompletionError),

    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("knowledge store unavailable: {0}")]
    Unavailable(String),

    #[error("knowledge store timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::Http(error) => error.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    #[error("input too large for embedding model: ~{estimated_tokens} tokens, limit {limit}")]
    TooLarge { estimated_tokens: usize, limit: usize },

    #[error("embedding timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(error: reqwest::Error) -> Self {
        EmbeddingError::Unavailable(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion provider unavailable: {0}")]
    Unavailable(String),

    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for CompletionError {
    fn from(error: reqwest::Error) -> Self {
        CompletionError::Unavailable(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

const SNIPPET_MAX_CHARS: usize = 200;

/// Shortens an upstream response body for logs and error details.
pub(crate) fn body_snippet(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(SNIPPET_MAX_CHARS) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
