// ============================================================================
// MediaOrchestrator Tests
// ============================================================================

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex},
    time::Duration,
};

use media_bus::{
    backend::{RenderTarget, sim::SimBackend},
    bins::{MediaKind, Surface},
    element::State,
    profile::WireProfile,
    session::{BranchState, Direction, SessionState},
};
use tokio::sync::mpsc;

use super::{AnnounceBudget, MediaOrchestrator, OrchestratorOptions};
use crate::{
    media::types::{OrchestratorStatus, SignalEvent, UiEvent},
    signal::{Signaling, address_resolver},
};

const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const PEER_A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
const PEER_B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

#[derive(Default)]
struct RecordingSignaling {
    offline: bool,
    announced: Mutex<Vec<IpAddr>>,
    chat: Mutex<Vec<(String, String)>>,
}

impl Signaling for RecordingSignaling {
    fn is_connected(&self) -> bool {
        !self.offline
    }

    fn announce_ip(&self, ip: IpAddr) -> anyhow::Result<()> {
        self.announced.lock().unwrap().push(ip);
        Ok(())
    }

    fn send_chat(&self, nick: &str, line: &str) -> anyhow::Result<()> {
        self.chat
            .lock()
            .unwrap()
            .push((nick.to_string(), line.to_string()));
        Ok(())
    }
}

struct Harness {
    sim: SimBackend,
    signaling: Arc<RecordingSignaling>,
    ui: mpsc::UnboundedReceiver<UiEvent>,
    orchestrator: MediaOrchestrator,
}

fn options(shared: bool) -> OrchestratorOptions {
    OrchestratorOptions {
        nick: "alice".to_string(),
        shared,
        settle_timeout: Duration::from_millis(500),
        profile: WireProfile::default(),
        local_address: address_resolver(Some(LOCAL)),
    }
}

fn harness_with(signaling: RecordingSignaling, options: OrchestratorOptions) -> Harness {
    let sim = SimBackend::new();
    let signaling = Arc::new(signaling);
    let (ui_tx, ui) = mpsc::unbounded_channel();
    let orchestrator = MediaOrchestrator::new(
        Arc::new(sim.clone()),
        signaling.clone(),
        ui_tx,
        options,
    );
    Harness {
        sim,
        signaling,
        ui,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(RecordingSignaling::default(), options(false))
}

async fn wait_for(
    orchestrator: &MediaOrchestrator,
    check: impl Fn(&OrchestratorStatus) -> bool,
) -> OrchestratorStatus {
    for _ in 0..200 {
        let status = orchestrator.status().await.unwrap();
        if check(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached: {:?}", orchestrator.status().await);
}

fn state_of(status: &Option<media_bus::session::SessionStatus>) -> Option<SessionState> {
    status.as_ref().map(|s| s.state)
}

fn drain(ui: &mut mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
    let mut events = Vec::new();
    while let Ok(event) = ui.try_recv() {
        events.push(event);
    }
    events
}

async fn outgoing_playing(h: &Harness) {
    h.orchestrator.on_peer_ip_announced(PEER_A).await.unwrap();
    wait_for(&h.orchestrator, |s| {
        state_of(&s.outgoing) == Some(SessionState::Playing)
    })
    .await;
}

// ------------------------------------------------------------------------
// Incoming session
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_build_incoming_once() {
    let h = harness();
    for _ in 0..3 {
        h.orchestrator.build_incoming().await.unwrap();
    }
    assert_eq!(h.sim.pipelines_created("incoming"), 1);

    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(state_of(&status.incoming), Some(SessionState::Built));
    assert!(status.outgoing.is_none());
}

#[tokio::test]
async fn test_start_stop_incoming() {
    let h = harness();
    assert!(h.orchestrator.start_incoming().await.is_err());

    h.orchestrator.build_incoming().await.unwrap();
    h.orchestrator.start_incoming().await.unwrap();
    assert_eq!(h.sim.pipeline_state("incoming"), Some(State::Playing));
    let created = h.sim.elements_created();

    h.orchestrator.stop_incoming().await.unwrap();
    h.orchestrator.start_incoming().await.unwrap();
    assert_eq!(h.sim.pipeline_state("incoming"), Some(State::Playing));
    assert_eq!(h.sim.elements_created(), created);
}

// ------------------------------------------------------------------------
// Outgoing session
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_announced_peer_starts_after_settle() {
    let h = harness();
    outgoing_playing(&h).await;

    assert_eq!(h.sim.pipeline_state("outgoing"), Some(State::Playing));
    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(status.outgoing.and_then(|s| s.peer), Some(PEER_A));
}

#[tokio::test]
async fn test_second_peer_ignored() {
    let h = harness();
    h.orchestrator.on_peer_ip_announced(PEER_A).await.unwrap();
    h.orchestrator.on_peer_ip_announced(PEER_B).await.unwrap();
    h.orchestrator.on_peer_ip_announced(PEER_B).await.unwrap();

    assert_eq!(h.sim.pipelines_created("outgoing"), 1);
    let hosts: Vec<_> = h
        .sim
        .elements("outgoing", "udpsink")
        .iter()
        .filter_map(|e| e.properties.get("host").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    assert_eq!(hosts, vec!["10.0.0.5".to_string(), "10.0.0.5".to_string()]);
}

#[tokio::test]
async fn test_failed_outgoing_build_retries_first_peer() {
    let h = harness();
    h.sim.missing_factory("theoraenc");

    assert!(h.orchestrator.on_peer_ip_announced(PEER_A).await.is_err());
    let status = h.orchestrator.status().await.unwrap();
    let outgoing = status.outgoing.unwrap();
    assert_eq!(outgoing.state, SessionState::Unbuilt);
    assert_eq!(outgoing.peer, Some(PEER_A));
    assert!(h.sim.live_pipelines().iter().all(|p| p != "outgoing"));

    h.sim.clear_faults();
    h.orchestrator.on_peer_ip_announced(PEER_B).await.unwrap();
    let udp = h.sim.element("outgoing", "udpsink").unwrap();
    assert_eq!(udp.properties.get("host").and_then(|v| v.as_str()), Some("10.0.0.5"));
}

#[tokio::test]
async fn test_stopped_before_settle_is_not_started() {
    let h = harness();
    h.orchestrator.on_peer_ip_announced(PEER_A).await.unwrap();
    h.orchestrator.stop_outgoing().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(state_of(&status.outgoing), Some(SessionState::Stopped));
    assert_eq!(h.sim.pipeline_state("outgoing"), Some(State::Null));
}

// ------------------------------------------------------------------------
// Announce budget
// ------------------------------------------------------------------------

#[test]
fn test_budget_initial_value() {
    assert_eq!(AnnounceBudget::new(false).remaining(), 2);
    assert_eq!(AnnounceBudget::new(true).remaining(), 1);
}

#[tokio::test]
async fn test_join_requests_spend_budget() {
    let h = harness();
    for _ in 0..3 {
        h.orchestrator.on_join_requested().await.unwrap();
    }
    assert_eq!(*h.signaling.announced.lock().unwrap(), vec![LOCAL, LOCAL]);
    assert_eq!(h.orchestrator.status().await.unwrap().announce_budget, 0);
}

#[tokio::test]
async fn test_shared_session_announces_once() {
    let h = harness_with(RecordingSignaling::default(), options(true));
    h.orchestrator.on_join_requested().await.unwrap();
    h.orchestrator.on_join_requested().await.unwrap();
    assert_eq!(h.signaling.announced.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_join_without_address_keeps_budget() {
    let mut opts = options(false);
    opts.local_address = Arc::new(|| Err(anyhow::anyhow!("could not find ip address")));
    let h = harness_with(RecordingSignaling::default(), opts);

    h.orchestrator.on_join_requested().await.unwrap();
    assert!(h.signaling.announced.lock().unwrap().is_empty());
    assert_eq!(h.orchestrator.status().await.unwrap().announce_budget, 2);
}

#[tokio::test]
async fn test_join_while_offline_keeps_budget() {
    let offline = RecordingSignaling {
        offline: true,
        ..Default::default()
    };
    let h = harness_with(offline, options(false));
    h.orchestrator.on_join_requested().await.unwrap();
    assert!(h.signaling.announced.lock().unwrap().is_empty());
    assert_eq!(h.orchestrator.status().await.unwrap().announce_budget, 2);
}

// ------------------------------------------------------------------------
// Faults
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_incoming_fault_leaves_outgoing_running() {
    let mut h = harness();
    h.orchestrator.build_incoming().await.unwrap();
    h.orchestrator.start_incoming().await.unwrap();
    outgoing_playing(&h).await;
    drain(&mut h.ui);

    assert!(h.sim.post_error("incoming", "theoradec", "decode error"));
    let status = wait_for(&h.orchestrator, |s| {
        state_of(&s.incoming) == Some(SessionState::Faulted)
    })
    .await;
    assert_eq!(state_of(&status.outgoing), Some(SessionState::Playing));
    assert_eq!(h.sim.pipeline_state("incoming"), Some(State::Null));

    let faults: Vec<_> = drain(&mut h.ui)
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::StreamFaulted {
                direction,
                kind,
                reason,
            } => Some((direction, kind, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(faults.len(), 1);
    assert_eq!((faults[0].0, faults[0].1), (Direction::Incoming, MediaKind::Video));
    assert!(faults[0].2.contains("decode error"));
}

#[tokio::test]
async fn test_faulted_incoming_rebuilt_on_start() {
    let h = harness();
    h.orchestrator.build_incoming().await.unwrap();
    h.orchestrator.start_incoming().await.unwrap();

    assert!(h.sim.post_error("incoming", "udpsrc", "socket closed"));
    wait_for(&h.orchestrator, |s| {
        state_of(&s.incoming) == Some(SessionState::Faulted)
    })
    .await;

    h.orchestrator.start_incoming().await.unwrap();
    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(state_of(&status.incoming), Some(SessionState::Playing));
    assert_eq!(h.sim.pipelines_created("incoming"), 2);
    assert_eq!(h.sim.live_pipelines(), vec!["incoming".to_string()]);
    assert_eq!(h.sim.pipeline_state("incoming"), Some(State::Playing));
}

#[tokio::test]
async fn test_refused_start_is_reported_to_caller() {
    let h = harness();
    h.orchestrator.build_incoming().await.unwrap();
    h.sim.fail_state("theoradec", State::Playing);

    assert!(h.orchestrator.start_incoming().await.is_err());
    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(state_of(&status.incoming), Some(SessionState::Faulted));

    h.sim.clear_faults();
    h.orchestrator.start_incoming().await.unwrap();
    let status = h.orchestrator.status().await.unwrap();
    assert_eq!(state_of(&status.incoming), Some(SessionState::Playing));
}

#[tokio::test]
async fn test_faulted_outgoing_rebuilt_for_first_peer() {
    let h = harness();
    outgoing_playing(&h).await;

    assert!(h.sim.post_error("outgoing", "udpsink", "network unreachable"));
    wait_for(&h.orchestrator, |s| {
        state_of(&s.outgoing) == Some(SessionState::Faulted)
    })
    .await;

    h.orchestrator.on_peer_ip_announced(PEER_B).await.unwrap();
    let status = wait_for(&h.orchestrator, |s| {
        state_of(&s.outgoing) == Some(SessionState::Playing)
    })
    .await;
    assert_eq!(status.outgoing.and_then(|s| s.peer), Some(PEER_A));
    assert_eq!(h.sim.pipelines_created("outgoing"), 2);
    for sink in h.sim.elements("outgoing", "udpsink") {
        assert_eq!(sink.properties.get("host").and_then(|v| v.as_str()), Some("10.0.0.5"));
    }
}

#[tokio::test]
async fn test_unattributed_fault_reports_every_kind() {
    let mut h = harness();
    h.orchestrator.build_incoming().await.unwrap();
    h.orchestrator.start_incoming().await.unwrap();

    h.sim.post_pipeline_error("incoming", "network down");
    wait_for(&h.orchestrator, |s| {
        state_of(&s.incoming) == Some(SessionState::Faulted)
    })
    .await;

    let mut kinds: Vec<_> = drain(&mut h.ui)
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::StreamFaulted { kind, .. } => Some(kind),
            _ => None,
        })
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec![MediaKind::Video, MediaKind::Audio]);
}

#[tokio::test]
async fn test_end_of_stream_reported() {
    let mut h = harness();
    h.orchestrator.build_incoming().await.unwrap();
    h.orchestrator.start_incoming().await.unwrap();

    h.sim.post_eos("incoming", Some("speexdec"));
    wait_for(&h.orchestrator, |s| {
        state_of(&s.incoming) == Some(SessionState::Stopped)
    })
    .await;
    let ended: Vec<_> = drain(&mut h.ui)
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::StreamEnded { direction, kind } => Some((direction, kind)),
            _ => None,
        })
        .collect();
    assert_eq!(ended, vec![(Direction::Incoming, MediaKind::Audio)]);
}

// ------------------------------------------------------------------------
// Toggles
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_toggle_without_outgoing_is_noop() {
    let h = harness();
    assert!(!h.orchestrator.toggle_outgoing_video(false).await.unwrap());
    assert!(!h.orchestrator.toggle_outgoing_audio(true).await.unwrap());
}

#[tokio::test]
async fn test_video_toggle_round_trip_keeps_audio() {
    let h = harness();
    outgoing_playing(&h).await;
    let audio_state = || h.sim.element("outgoing", "speexenc").map(|e| e.state);

    assert!(h.orchestrator.toggle_outgoing_video(false).await.unwrap());
    assert_eq!(h.sim.element("outgoing", "theoraenc").unwrap().state, State::Null);
    assert_eq!(audio_state(), Some(State::Playing));

    assert!(h.orchestrator.toggle_outgoing_video(true).await.unwrap());
    assert_eq!(h.sim.element("outgoing", "theoraenc").unwrap().state, State::Playing);
    assert_eq!(audio_state(), Some(State::Playing));

    let status = h.orchestrator.status().await.unwrap();
    let branches = status.outgoing.unwrap().branches;
    assert!(branches.iter().all(|b| b.state == BranchState::Playing));
}

// ------------------------------------------------------------------------
// Render targets
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_render_target_answer_reaches_sink() {
    let mut h = harness();
    h.orchestrator.build_incoming().await.unwrap();
    h.orchestrator.start_incoming().await.unwrap();

    let request = loop {
        let event = tokio::time::timeout(Duration::from_secs(1), h.ui.recv())
            .await
            .unwrap()
            .unwrap();
        if let UiEvent::RenderTargetRequested(request) = event {
            break request;
        }
    };
    assert_eq!(request.direction, Direction::Incoming);
    assert_eq!((request.kind, request.surface), (MediaKind::Video, Surface::Remote));
    assert!(request.provide(RenderTarget(0x5a)));

    for _ in 0..200 {
        let target = h
            .sim
            .element("incoming", "autovideosink")
            .and_then(|e| e.render_target);
        if target == Some(RenderTarget(0x5a)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("render target never applied");
}

// ------------------------------------------------------------------------
// Chat
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_buddy_notices_and_chat_lines() {
    let mut h = harness();
    h.orchestrator
        .handle_signal(SignalEvent::BuddyJoined {
            name: "bob".to_string(),
        })
        .await
        .unwrap();
    h.orchestrator
        .handle_signal(SignalEvent::ChatMessageReceived {
            sender: "bob".to_string(),
            text: "<bob> hi".to_string(),
        })
        .await
        .unwrap();
    h.orchestrator
        .handle_signal(SignalEvent::BuddyLeft {
            name: "bob".to_string(),
        })
        .await
        .unwrap();

    let lines: Vec<_> = drain(&mut h.ui)
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::Chat(line) => Some(line),
            _ => None,
        })
        .collect();
    assert_eq!(
        lines,
        vec![
            "bob has joined the chat".to_string(),
            "<bob> hi".to_string(),
            "bob has left the chat".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_send_chat_formats_line() {
    let h = harness();
    assert!(h.orchestrator.send_chat("hello").await.unwrap());
    assert!(!h.orchestrator.send_chat("   ").await.unwrap());
    assert_eq!(
        *h.signaling.chat.lock().unwrap(),
        vec![("alice".to_string(), "<alice> hello".to_string())]
    );
}

// ------------------------------------------------------------------------
// Shutdown
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_shutdown_without_sessions() {
    let h = harness();
    h.orchestrator.shutdown().await.unwrap();
    h.orchestrator.shutdown().await.unwrap();
    assert!(h.sim.live_pipelines().is_empty());
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let h = harness();
    h.orchestrator.build_incoming().await.unwrap();
    h.orchestrator.start_incoming().await.unwrap();
    outgoing_playing(&h).await;
    assert_eq!(h.sim.live_pipelines().len(), 2);

    h.orchestrator.shutdown().await.unwrap();
    assert!(h.sim.live_pipelines().is_empty());
    h.orchestrator.shutdown().await.unwrap();

    let err = h.orchestrator.build_incoming().await.unwrap_err();
    assert!(err.to_string().contains("shut down"));
    assert!(h.orchestrator.on_peer_ip_announced(PEER_B).await.is_err());
}
