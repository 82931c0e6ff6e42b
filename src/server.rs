use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::generation::{self, build_prompt_messages};
use crate::loader::ModelSlot;
use crate::pool::WorkerPool;
use crate::protocol::{ChatRequest, ChatResponse, HealthResponse, RootResponse};

#[derive(Clone)]
pub struct AppState {
    pub slot: Arc<ModelSlot>,
    pub pool: Arc<WorkerPool>,
    /// Name reported by `GET /`
    pub model_name: Arc<str>,
    pub default_system_prompt: Arc<str>,
}

pub async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    Json(RootResponse {
        status: "ok".to_string(),
        model: state.model_name.to_string(),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.slot.health())
}

pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    request.validate()?;

    let provider = state.slot.provider().ok_or(ApiError::ModelNotReady)?;

    let request_id = uuid::Uuid::new_v4();
    let messages = build_prompt_messages(
        request.resolved_system_prompt(&state.default_system_prompt),
        &request.messages,
    );
    let params = request.generation_params();

    tracing::info!(
        %request_id,
        message_count = messages.len(),
        max_tokens = params.max_new_tokens,
        temperature = params.temperature,
        "Received chat request"
    );

    let started = Instant::now();
    let result = state
        .pool
        .run(move |cancel| generation::complete(provider.as_ref(), &messages, &params, cancel))
        .await;

    match result {
        Ok(completion) => {
            tracing::info!(
                %request_id,
                prompt_tokens = completion.prompt_tokens,
                completion_tokens = completion.completion_tokens,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Chat completion finished"
            );
            Ok(Json(ChatResponse {
                response: completion.text,
            }))
        }
        Err(e) => {
            tracing::error!(%request_id, error = %e, "Chat completion failed");
            Err(e.into())
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/chat", post(chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
