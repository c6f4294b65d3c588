use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A user question that passed validation: non-empty after trimming.
///
/// The raw text is kept untouched so downstream queries see exactly what the
/// user typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question(String);

impl Question {
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        if raw.trim().is_empty() {
            return Err(PipelineError::InvalidInput);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentChunk {
    pub id: String,
    pub title: String,
    pub body: String,
    pub embedding: Option<Vec<f32>>,
    /// Cosine similarity in `[0, 1]`, only present on vector search results.
    pub similarity: Option<f64>,
}

impl ContentChunk {
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            embedding: None,
            similarity: None,
        }
    }

    pub fn with_similarity(mut self, similarity: f64) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn is_blank(&self) -> bool {
        self.body.trim().is_empty()
    }

    /// Length of the trimmed body in characters.
    pub fn body_chars(&self) -> usize {
        self.body.trim().chars().count()
    }
}

/// Chunks returned by one search stage, in the store's relevance order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchSet {
    chunks: Vec<ContentChunk>,
}

impl MatchSet {
    pub fn new(chunks: Vec<ContentChunk>) -> Self {
        Self { chunks }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ContentChunk> {
        self.chunks.iter()
    }

    pub fn top_similarity(&self) -> Option<f64> {
        self.chunks.first().and_then(|chunk| chunk.similarity)
    }

    pub fn into_chunks(self) -> Vec<ContentChunk> {
        self.chunks
    }
}

impl FromIterator<ContentChunk> for MatchSet {
    fn from_iter<I: IntoIterator<Item = ContentChunk>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for MatchSet {
    type Item = ContentChunk;
    type IntoIter = std::vec::IntoIter<ContentChunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter()
    }
}

impl<'a> IntoIterator for &'a MatchSet {
    type Item = &'a ContentChunk;
    type IntoIter = std::slice::Iter<'a, ContentChunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Retrieval stages that run before the completion fallback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Lexical,
    Vector,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Lexical => f.write_str("lexical"),
            StageKind::Vector => f.write_str("vector"),
        }
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lexical" | "text" => Ok(StageKind::Lexical),
            "vector" => Ok(StageKind::Vector),
            other => Err(format!("unknown stage `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplySource {
    Lexical,
    Vector,
    Completion,
}

impl From<StageKind> for ReplySource {
    fn from(stage: StageKind) -> Self {
        match stage {
            StageKind::Lexical => ReplySource::Lexical,
            StageKind::Vector => ReplySource::Vector,
        }
    }
}

/// The single answer produced for a question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub text: String,
    pub source: ReplySource,
    /// Set when the reply is a verbatim chunk body.
    pub chunk_id: Option<String>,
}

impl Reply {
    pub fn from_chunk(chunk: ContentChunk, stage: StageKind) -> Self {
        Self {
            text: chunk.body,
            source: stage.into(),
            chunk_id: Some(chunk.id),
        }
    }

    pub fn generated(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: ReplySource::Completion,
            chunk_id: None,
        }
    }
}
