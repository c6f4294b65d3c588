use crate::{CompletionError, EmbeddingError, MatchSet, StoreError};
use async_trait::async_trait;
use std::sync::Arc;

/// Read-only access to previously ingested website content.
#[async_trait]
pub trait KnowledgeStore {
    async fn lexical_search(&self, text: &str, limit: usize) -> Result<MatchSet, StoreError>;

    async fn vector_search(
        &self,
        vector: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<MatchSet, StoreError>;
}

#[async_trait]
pub trait EmbeddingGenerator {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[async_trait]
pub trait CompletionGenerator {
    async fn complete(&self, system_prompt: &str, user_message: &str)
        -> Result<String, CompletionError>;
}

#[async_trait]
impl<T> KnowledgeStore for Arc<T>
where
    T: KnowledgeStore + Send + Sync + ?Sized,
{
    async fn lexical_search(&self, text: &str, limit: usize) -> Result<MatchSet, StoreError> {
        (**self).lexical_search(text, limit).await
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<MatchSet, StoreError> {
        (**self).vector_search(vector, threshold, limit).await
    }
}

#[async_trait]
impl<T> EmbeddingGenerator for Arc<T>
where
    T: EmbeddingGenerator + Send + Sync + ?Sized,
{
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed(text).await
    }
}

#[async_trait]
impl<T> CompletionGenerator for Arc<T>
where
    T: CompletionGenerator + Send + Sync + ?Sized,
{
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<String, CompletionError> {
        (**self).complete(system_prompt, user_message).await
    }
}
