use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use trellis_core::definition::AgentDefinition;
use trellis_core::error::TrellisError;
use trellis_core::traits::AgentRepository;
use trellis_core::value::VarMap;

use crate::state::AppState;

fn error_body(message: String) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": false, "error": message }))
}

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /api/agents
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match state.repository.list() {
        Ok(defs) => {
            let agents: Vec<serde_json::Value> = defs
                .iter()
                .map(|def| {
                    serde_json::json!({
                        "name": def.name,
                        "title": def.display_title(),
                        "atomic": def.is_atomic(),
                    })
                })
                .collect();
            Ok(Json(serde_json::json!({ "agents": agents })))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))),
    }
}

// GET /api/agents/{name}
pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AgentDefinition>, (StatusCode, Json<serde_json::Value>)> {
    match state.repository.get(&name) {
        Ok(def) => Ok(Json(def)),
        Err(TrellisError::UnknownAgent(_)) => Err((
            StatusCode::NOT_FOUND,
            error_body(format!("agent '{name}' not found")),
        )),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))),
    }
}

// PUT /api/agents/{name}
pub async fn save_agent(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(mut def): Json<AgentDefinition>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    def.name = name;
    if let Err(e) = def.normalize() {
        return Err((StatusCode::BAD_REQUEST, error_body(e.to_string())));
    }
    match state.repository.save(&def) {
        Ok(()) => Ok(Json(serde_json::json!({ "ok": true }))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))),
    }
}

#[derive(Deserialize)]
pub struct RunRequest {
    pub agent: String,
    #[serde(default)]
    pub input: VarMap,
}

// POST /api/agents/run: execute by name, return the full run record.
pub async fn run_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RunRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    info!(agent = %body.agent, "run requested");
    match state.interpreter.run(&body.agent, body.input).await {
        Ok(record) => Ok(Json(serde_json::json!(record))),
        Err(TrellisError::UnknownAgent(name)) => Err((
            StatusCode::NOT_FOUND,
            error_body(format!("agent '{name}' not found")),
        )),
        Err(e) => Err((StatusCode::BAD_REQUEST, error_body(e.to_string()))),
    }
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    pub text: String,
}

// POST /api/chat/send: answer the pending question (or leave a note).
pub async fn chat_send(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if body.text.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            error_body("text must not be empty".to_string()),
        ));
    }
    match state.chat.answer(&body.text).await {
        Ok(message) => Ok(Json(serde_json::json!(message))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))),
    }
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub after: u64,
}

// GET /api/chat/messages?after=<id>
pub async fn chat_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
) -> Json<serde_json::Value> {
    let messages = state.chat.messages_after(query.after).await;
    Json(serde_json::json!({ "messages": messages }))
}

// GET /api/chat/pending
pub async fn chat_pending(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let pending = state.chat.pending_question().await;
    Json(serde_json::json!({ "pending": pending }))
}
