//! HTTP boundary for the chat widget.
//!
//! | Method    | Path        | Description                          |
//! |-----------|-------------|--------------------------------------|
//! | `POST`    | `/api/chat` | `{message, sessionId?}` -> `{reply}` |
//! | `OPTIONS` | `/api/chat` | `204 No Content`                     |
//! | `GET`     | `/health`   | status and version                   |
//!
//! Errors are always `{ "error": "<generic message>" }`; upstream error text
//! only goes to the logs.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use site_chat_core::{
    AnswerPipeline, CompletionGenerator, EmbeddingGenerator, KnowledgeStore, PipelineError,
};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default, alias = "question")]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::Pipeline(PipelineError::InvalidInput) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Pipeline(PipelineError::UpstreamUnavailable(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Pipeline(PipelineError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) | AppError::Pipeline(PipelineError::InvalidInput) => {
                "Missing or invalid 'message'."
            }
            AppError::Pipeline(PipelineError::UpstreamUnavailable(_)) => {
                "Sorry, we couldn't generate a reply right now. Please try again later."
            }
            AppError::Pipeline(PipelineError::Cancelled) => "Request cancelled.",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "chat request failed");
        } else {
            warn!(error = %self, "chat request rejected");
        }
        let body = ErrorBody {
            error: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

pub fn router<S, E, C>(pipeline: Arc<AnswerPipeline<S, E, C>>, allowed_origins: &[String]) -> Router
where
    S: KnowledgeStore + Send + Sync + 'static,
    E: EmbeddingGenerator + Send + Sync + 'static,
    C: CompletionGenerator + Send + Sync + 'static,
{
    Router::new()
        .route("/api/chat", post(handle_chat::<S, E, C>).options(handle_preflight))
        .route("/health", get(handle_health))
        .layer(cors_layer(allowed_origins))
        .layer(middleware::map_response(preflight_no_content))
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if allowed_origins.iter().any(|origin| origin.trim() == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub async fn serve<S, E, C>(
    pipeline: Arc<AnswerPipeline<S, E, C>>,
    bind: &str,
    allowed_origins: &[String],
) -> anyhow::Result<()>
where
    S: KnowledgeStore + Send + Sync + 'static,
    E: EmbeddingGenerator + Send + Sync + 'static,
    C: CompletionGenerator + Send + Sync + 'static,
{
    let app = router(pipeline, allowed_origins);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %listener.local_addr()?, "chat server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn handle_chat<S, E, C>(
    State(pipeline): State<Arc<AnswerPipeline<S, E, C>>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError>
where
    S: KnowledgeStore + Send + Sync + 'static,
    E: EmbeddingGenerator + Send + Sync + 'static,
    C: CompletionGenerator + Send + Sync + 'static,
{
    let Json(request) = payload?;
    let message = request
        .message
        .ok_or_else(|| AppError::BadRequest("missing message".to_string()))?;

    info!(
        session_id = request.session_id.as_deref().unwrap_or("-"),
        message_len = message.len(),
        "chat request"
    );

    // Dropping this future (client disconnect) drops any in-flight upstream call.
    let reply = pipeline.answer(&message).await?;
    info!(source = ?reply.source, "chat reply");

    Ok(Json(ChatResponse { reply: reply.text }))
}

async fn handle_preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// The CORS layer answers preflights itself with `200`; the widget contract is `204`.
async fn preflight_no_content(method: Method, mut response: Response) -> Response {
    if method == Method::OPTIONS && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
