use std::{
    fmt::{Display, Formatter},
    net::IpAddr,
};

use media_bus::{
    backend::RenderTarget,
    bins::{MediaKind, Surface},
    session::{Direction, SessionStatus},
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

// ============================================================================
// Signaling
// ============================================================================

/// Events delivered by the signaling collaborator (the peer's control API).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SignalEvent {
    PeerIpAnnounced { ip: IpAddr },
    JoinRequested,
    BuddyJoined { name: String },
    BuddyLeft { name: String },
    ChatMessageReceived { sender: String, text: String },
}

impl Display for SignalEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalEvent::PeerIpAnnounced { ip } => write!(f, "peer ip {}", ip),
            SignalEvent::JoinRequested => f.write_str("join requested"),
            SignalEvent::BuddyJoined { name } => write!(f, "buddy {} joined", name),
            SignalEvent::BuddyLeft { name } => write!(f, "buddy {} left", name),
            SignalEvent::ChatMessageReceived { sender, .. } => write!(f, "chat from {}", sender),
        }
    }
}

// ============================================================================
// UI
// ============================================================================

/// A video sink is about to draw and asks the UI for a window.
///
/// Dropping the request without answering leaves the sink to its own devices.
#[derive(Debug)]
pub struct RenderTargetRequest {
    pub direction: Direction,
    pub kind: MediaKind,
    pub surface: Surface,
    responder: oneshot::Sender<RenderTarget>,
}

impl RenderTargetRequest {
    pub(crate) fn new(
        direction: Direction,
        kind: MediaKind,
        surface: Surface,
    ) -> (Self, oneshot::Receiver<RenderTarget>) {
        let (responder, rx) = oneshot::channel();
        (
            Self {
                direction,
                kind,
                surface,
                responder,
            },
            rx,
        )
    }

    /// Hands the window over. Returns `false` if the pipeline is already gone.
    pub fn provide(self, target: RenderTarget) -> bool {
        self.responder.send(target).is_ok()
    }
}

#[derive(Debug)]
pub enum UiEvent {
    RenderTargetRequested(RenderTargetRequest),
    StreamFaulted {
        direction: Direction,
        kind: MediaKind,
        reason: String,
    },
    StreamEnded {
        direction: Direction,
        kind: MediaKind,
    },
    /// A line for the chat transcript.
    Chat(String),
}

// ============================================================================
// Status
// ============================================================================

#[derive(Clone, Debug, Serialize)]
pub struct OrchestratorStatus {
    pub incoming: Option<SessionStatus>,
    pub outgoing: Option<SessionStatus>,
    pub announce_budget: u8,
    pub shut_down: bool,
}
