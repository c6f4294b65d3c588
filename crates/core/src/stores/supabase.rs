use crate::error::body_snippet;
use crate::traits::KnowledgeStore;
use crate::{ContentChunk, MatchSet, StoreError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

const BACKEND: &str = "supabase";
const TEXT_SEARCH_RPC: &str = "match_website_content_text";
const VECTOR_SEARCH_RPC: &str = "match_website_content";

/// Knowledge store backed by two PostgREST RPC functions.
pub struct SupabaseStore {
    client: Client,
    endpoint: String,
    service_key: String,
}

impl SupabaseStore {
    pub fn new(endpoint: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self::with_client(Client::new(), endpoint, service_key)
    }

    pub fn with_client(
        client: Client,
        endpoint: impl Into<String>,
        service_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        }
    }

    pub fn rpc_url(&self, function: &str) -> Result<Url, StoreError> {
        Url::parse(&format!("{}/rest/v1/rpc/{}", self.endpoint, function))
            .map_err(|error| StoreError::Unavailable(format!("bad store url: {error}")))
    }

    async fn call_rpc(&self, function: &str, body: Value) -> Result<MatchSet, StoreError> {
        let started = Instant::now();
        let url = self.rpc_url(function)?;

        let response = self
            .client
            .post(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, rpc = function, snippet = %body_snippet(&text), "store rpc failed");
            return Err(StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{function} returned {status}"),
            });
        }

        let payload: Value = response.json().await?;
        let matches = parse_rows(&payload);
        debug!(
            rpc = function,
            matches = matches.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "store rpc completed"
        );
        Ok(matches)
    }
}

#[async_trait]
impl KnowledgeStore for SupabaseStore {
    async fn lexical_search(&self, text: &str, limit: usize) -> Result<MatchSet, StoreError> {
        self.call_rpc(
            TEXT_SEARCH_RPC,
            json!({
                "query_text": text,
                "match_count": limit,
            }),
        )
        .await
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<MatchSet, StoreError> {
        if vector.is_empty() {
            return Err(StoreError::Unavailable(
                "query embedding must not be empty".to_string(),
            ));
        }

        self.call_rpc(
            VECTOR_SEARCH_RPC,
            json!({
                "query_embedding": vector,
                "match_threshold": threshold,
                "match_count": limit,
            }),
        )
        .await
    }
}

/// Anything other than a JSON array is treated as "no matches".
fn parse_rows(payload: &Value) -> MatchSet {
    let Some(rows) = payload.as_array() else {
        return MatchSet::empty();
    };

    rows.iter()
        .map(|row| {
            let id = match row.get("id") {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => String::new(),
            };
            let title = row
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let body = row
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let similarity = row.get("similarity").and_then(Value::as_f64);

            ContentChunk {
                id,
                title,
                body,
                embedding: None,
                similarity,
            }
        })
        .collect()
}
