use std::{net::IpAddr, sync::Arc};

use axum::{Json, Router, extract::State, routing::post};
use serde::{Deserialize, Serialize};

use crate::{handler::ApiJsonResult, media::orchestrator::MediaOrchestrator, media::types::SignalEvent};

/// Inbound signaling from the peer.
pub fn signal_router() -> Router<Arc<MediaOrchestrator>> {
    Router::new()
        .route("/", post(signal))
        .route("/ip", post(peer_ip))
        .route("/join", post(join))
        .route("/buddy", post(buddy))
        .route("/chat", post(chat))
}

#[derive(Serialize, Deserialize)]
struct IpRequest {
    ip: IpAddr,
}

#[derive(Serialize, Deserialize)]
struct BuddyRequest {
    name: String,
    joined: bool,
}

#[derive(Serialize, Deserialize)]
struct ChatRequest {
    sender: String,
    text: String,
}

async fn signal(
    State(orchestrator): State<Arc<MediaOrchestrator>>,
    Json(event): Json<SignalEvent>,
) -> ApiJsonResult<bool> {
    orchestrator.handle_signal(event).await?;
    Ok(Json(true))
}

async fn peer_ip(
    State(orchestrator): State<Arc<MediaOrchestrator>>,
    Json(request): Json<IpRequest>,
) -> ApiJsonResult<bool> {
    orchestrator.on_peer_ip_announced(request.ip).await?;
    Ok(Json(true))
}

async fn join(State(orchestrator): State<Arc<MediaOrchestrator>>) -> ApiJsonResult<bool> {
    orchestrator.on_join_requested().await?;
    Ok(Json(true))
}

async fn buddy(
    State(orchestrator): State<Arc<MediaOrchestrator>>,
    Json(request): Json<BuddyRequest>,
) -> ApiJsonResult<bool> {
    let event = if request.joined {
        SignalEvent::BuddyJoined { name: request.name }
    } else {
        SignalEvent::BuddyLeft { name: request.name }
    };
    orchestrator.handle_signal(event).await?;
    Ok(Json(true))
}

async fn chat(
    State(orchestrator): State<Arc<MediaOrchestrator>>,
    Json(request): Json<ChatRequest>,
) -> ApiJsonResult<bool> {
    orchestrator
        .handle_signal(SignalEvent::ChatMessageReceived {
            sender: request.sender,
            text: request.text,
        })
        .await?;
    Ok(Json(true))
}
