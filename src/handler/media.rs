use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::{
    handler::ApiJsonResult,
    media::{orchestrator::MediaOrchestrator, types::OrchestratorStatus},
};

/// Local controls: the UI toolbar and chat entry.
pub fn media_router() -> Router<Arc<MediaOrchestrator>> {
    Router::new()
        .route("/status", get(status))
        .route("/video", post(toggle_video))
        .route("/audio", post(toggle_audio))
        .route("/chat", post(send_chat))
        .route("/{direction}/{action}", post(control))
}

#[derive(Serialize, Deserialize)]
struct ToggleRequest {
    enable: bool,
}

#[derive(Serialize, Deserialize)]
struct ChatRequest {
    text: String,
}

async fn status(State(orchestrator): State<Arc<MediaOrchestrator>>) -> ApiJsonResult<OrchestratorStatus> {
    Ok(Json(orchestrator.status().await?))
}

async fn toggle_video(
    State(orchestrator): State<Arc<MediaOrchestrator>>,
    Json(request): Json<ToggleRequest>,
) -> ApiJsonResult<bool> {
    Ok(Json(orchestrator.toggle_outgoing_video(request.enable).await?))
}

async fn toggle_audio(
    State(orchestrator): State<Arc<MediaOrchestrator>>,
    Json(request): Json<ToggleRequest>,
) -> ApiJsonResult<bool> {
    Ok(Json(orchestrator.toggle_outgoing_audio(request.enable).await?))
}

async fn send_chat(
    State(orchestrator): State<Arc<MediaOrchestrator>>,
    Json(request): Json<ChatRequest>,
) -> ApiJsonResult<bool> {
    Ok(Json(orchestrator.send_chat(&request.text).await?))
}

/// `/incoming/start`, `/outgoing/stop`, ...
async fn control(
    State(orchestrator): State<Arc<MediaOrchestrator>>,
    Path((direction, action)): Path<(String, String)>,
) -> ApiJsonResult<bool> {
    match (direction.as_str(), action.as_str()) {
        ("incoming", "start") => orchestrator.start_incoming().await?,
        ("incoming", "stop") => orchestrator.stop_incoming().await?,
        ("outgoing", "start") => orchestrator.start_outgoing().await?,
        ("outgoing", "stop") => orchestrator.stop_outgoing().await?,
        _ => {
            return Err(anyhow::anyhow!("unknown control {}/{}", direction, action).into());
        }
    }
    Ok(Json(true))
}
