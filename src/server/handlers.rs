//! JSON handlers for `/classify`, `/generate`, `/process` and `/health`.

use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::server::AppState;
use crate::error::{EngineError, ErrorExt};
use crate::types::{ClassificationResult, ConversationState, ModelDescriptor};

/// Request body for POST /classify.
#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub text: String,
    pub model: ModelDescriptor,
}

/// Response body for POST /classify.
#[derive(Debug, Serialize)]
pub struct ClassifyResponse {
    pub predicted_class: ClassificationResult,
}

/// Request body for POST /generate.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub text: String,
    pub model: ModelDescriptor,
    /// State returned by a previous conversational turn.
    #[serde(default)]
    pub chat_history_ids: Option<ConversationState>,
    #[serde(default)]
    pub device: Option<String>,
}

/// Response body for POST /generate.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub generated_text: String,
    pub chat_history_ids: Option<ConversationState>,
}

/// Request body for POST /process.
#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub text: String,
}

/// Response body for POST /process.
#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub input: String,
    pub predicted_class: ClassificationResult,
    pub generated_text: String,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Failure of a request, rendered as `{error}` with a matching status.
#[derive(Debug)]
pub enum ApiError {
    /// Body was not valid JSON or lacked a required field.
    BadRequest(String),
    Engine(EngineError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => match e.root() {
                EngineError::QueueFull { .. } | EngineError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match self {
            ApiError::BadRequest(message) => message,
            ApiError::Engine(e) => {
                if status.is_server_error() {
                    warn!(error = %e, retryable = e.is_retryable(), "Request failed");
                }
                e.to_string()
            }
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

fn require_text(text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::BadRequest("'text' must not be empty".to_string()));
    }
    Ok(())
}

/// POST /classify
pub async fn classify(
    State(state): State<AppState>,
    body: Result<Json<ClassifyRequest>, JsonRejection>,
) -> Result<Json<ClassifyResponse>, ApiError> {
    let Json(body) = body?;
    require_text(&body.text)?;
    let predicted_class = state.classifier.classify(&body.text, &body.model).await?;
    Ok(Json(ClassifyResponse { predicted_class }))
}

/// POST /generate
pub async fn generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(body) = body?;
    require_text(&body.text)?;
    let output = state
        .generator
        .generate(&body.text, &body.model, body.chat_history_ids, body.device)
        .await?;
    Ok(Json(GenerateResponse {
        generated_text: output.text,
        chat_history_ids: output.state,
    }))
}

/// POST /process
///
/// Classifies the text and replies with the model its sentiment selects.
pub async fn process(
    State(state): State<AppState>,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let Json(body) = body?;
    require_text(&body.text)?;

    let start = Instant::now();
    let result = state.router.route(&body.text).await;
    match &result {
        Ok(_) => state.metrics.record_success("route", start.elapsed()),
        Err(e) => state.metrics.record_error("route", e.kind(), start.elapsed()),
    }
    let outcome = result?;

    Ok(Json(ProcessResponse {
        input: body.text,
        predicted_class: outcome.classification,
        generated_text: outcome.reply,
    }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    match &state.engine {
        Some(engine) => Json(engine.health()).into_response(),
        None => Json(serde_json::json!({
            "status": "ok",
            "version": crate::VERSION,
            "uptime_secs": state.metrics.uptime().as_secs(),
            "metrics": state.metrics.snapshot(),
        }))
        .into_response(),
    }
}
