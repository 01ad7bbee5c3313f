use std::{
    collections::{HashMap, VecDeque},
    fmt::{Display, Formatter},
    net::IpAddr,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{
    backend::{Backend, BusEnvelope, BusMessage, RenderTarget},
    bins::{BinRecipe, MediaBin, MediaKind, Surface},
    element::{NodeId, NodeRef, PipelineId, State},
    error::{GraphError, GraphResult},
    graph::ElementGraph,
    preview::PreviewBranch,
    profile::WireProfile,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outgoing => f.write_str("outgoing"),
            Direction::Incoming => f.write_str("incoming"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Unbuilt,
    Built,
    Playing,
    Stopped,
    Faulted,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Unbuilt => "UNBUILT",
            SessionState::Built => "BUILT",
            SessionState::Playing => "PLAYING",
            SessionState::Stopped => "STOPPED",
            SessionState::Faulted => "FAULTED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    Playing,
    Stopped,
}

/// What a session builds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionPlan {
    /// Receive+decode for both media kinds on the fixed local ports.
    Incoming { profile: WireProfile },
    /// Capture, local preview and encode+send of both media kinds to `peer`.
    Outgoing { peer: IpAddr, profile: WireProfile },
}

impl SessionPlan {
    pub fn direction(&self) -> Direction {
        match self {
            SessionPlan::Incoming { .. } => Direction::Incoming,
            SessionPlan::Outgoing { .. } => Direction::Outgoing,
        }
    }

    pub fn peer(&self) -> Option<IpAddr> {
        match self {
            SessionPlan::Incoming { .. } => None,
            SessionPlan::Outgoing { peer, .. } => Some(*peer),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaultCause {
    /// Reported by the framework's error channel while running.
    Runtime(String),
    /// A state request was refused.
    StateChange(GraphError),
}

impl Display for FaultCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultCause::Runtime(reason) => write!(f, "runtime fault: {}", reason),
            FaultCause::StateChange(e) => write!(f, "{}", e),
        }
    }
}

/// Events surfaced to the session owner. `kind` is `None` when the framework
/// did not attribute the notification to a particular node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Faulted {
        kind: Option<MediaKind>,
        cause: FaultCause,
    },
    EndOfStream {
        kind: Option<MediaKind>,
    },
    RenderTargetRequested {
        kind: MediaKind,
        surface: Surface,
        node: NodeRef,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct BranchStatus {
    pub kind: MediaKind,
    pub state: BranchState,
    pub nodes: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub direction: Direction,
    pub state: SessionState,
    pub peer: Option<IpAddr>,
    pub nodes: usize,
    pub edges: usize,
    pub branches: Vec<BranchStatus>,
}

/// Nodes whose state a toggle flips, per media kind.
#[derive(Debug)]
struct Branch {
    kind: MediaKind,
    nodes: Vec<NodeRef>,
    state: BranchState,
}

/// One top-level graph with its lifecycle state.
///
/// All methods are synchronous and never block on data flow: state requests
/// are handed to the backend and their completion arrives later through
/// [`PipelineSession::handle_bus`]. Events are queued and collected with
/// [`PipelineSession::take_events`].
pub struct PipelineSession {
    name: String,
    plan: SessionPlan,
    state: SessionState,
    bus: mpsc::UnboundedSender<BusEnvelope>,
    graph: Option<ElementGraph>,
    branches: Vec<Branch>,
    attribution: HashMap<NodeRef, MediaKind>,
    render_sinks: HashMap<NodeRef, (MediaKind, Surface)>,
    render_targets: HashMap<NodeRef, RenderTarget>,
    ready_tx: Option<oneshot::Sender<()>>,
    ready_rx: Option<oneshot::Receiver<()>>,
    events: VecDeque<SessionEvent>,
}

impl PipelineSession {
    pub fn new(name: &str, plan: SessionPlan, bus: mpsc::UnboundedSender<BusEnvelope>) -> Self {
        Self {
            name: name.to_string(),
            plan,
            state: SessionState::Unbuilt,
            bus,
            graph: None,
            branches: Vec::new(),
            attribution: HashMap::new(),
            render_sinks: HashMap::new(),
            render_targets: HashMap::new(),
            ready_tx: None,
            ready_rx: None,
            events: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.plan.direction()
    }

    pub fn peer(&self) -> Option<IpAddr> {
        self.plan.peer()
    }

    pub fn pipeline_id(&self) -> Option<PipelineId> {
        self.graph.as_ref().map(|g| g.id())
    }

    pub fn graph(&self) -> Option<&ElementGraph> {
        self.graph.as_ref()
    }

    pub fn branch_state(&self, kind: MediaKind) -> Option<BranchState> {
        self.branches.iter().find(|b| b.kind == kind).map(|b| b.state)
    }

    pub fn kinds(&self) -> Vec<MediaKind> {
        self.branches.iter().map(|b| b.kind).collect()
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// Readiness signal of the last build, resolved once the pipeline reports
    /// READY. Can be taken once per build.
    pub fn take_ready(&mut self) -> Option<oneshot::Receiver<()>> {
        self.ready_rx.take()
    }

    /// Constructs and links every bin, then requests READY. A second call on
    /// a built session is a no-op. On failure the session stays UNBUILT with
    /// no graph left behind.
    pub fn build(&mut self, backend: &dyn Backend) -> GraphResult<()> {
        if self.state != SessionState::Unbuilt {
            log::warn!("{}: pipeline exists, build ignored", self.name);
            return Ok(());
        }

        log::info!("{}: building on {}", self.name, backend.name());
        let mut graph = ElementGraph::new(backend, &self.name, self.bus.clone())?;
        if let Err(e) = self.build_plan(&mut graph) {
            log::error!("{}: build failed: {}", self.name, e);
            self.forget_layout();
            graph.clear();
            return Err(e);
        }

        if let Err(e) = graph.set_state(State::Ready) {
            log::error!("{}: pipeline refused READY: {}", self.name, e);
            self.forget_layout();
            graph.clear();
            return Err(e);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        self.ready_tx = Some(ready_tx);
        self.ready_rx = Some(ready_rx);
        log::info!(
            "{}: built {} nodes, {} links",
            self.name,
            graph.node_count(),
            graph.edge_count()
        );
        self.graph = Some(graph);
        self.state = SessionState::Built;
        Ok(())
    }

    fn build_plan(&mut self, graph: &mut ElementGraph) -> GraphResult<()> {
        match self.plan.clone() {
            SessionPlan::Incoming { profile } => {
                let video = MediaBin::build(graph, &BinRecipe::receive_video(&profile))?;
                let audio = MediaBin::build(graph, &BinRecipe::receive_audio(&profile))?;
                self.register_bin(graph, &video, Surface::Remote);
                self.register_bin(graph, &audio, Surface::Remote);
                self.branches.push(Branch {
                    kind: MediaKind::Video,
                    nodes: video.nodes.clone(),
                    state: BranchState::Stopped,
                });
                self.branches.push(Branch {
                    kind: MediaKind::Audio,
                    nodes: audio.nodes.clone(),
                    state: BranchState::Stopped,
                });
            }
            SessionPlan::Outgoing { peer, profile } => {
                let video = PreviewBranch::build(
                    graph,
                    &BinRecipe::capture_video(&profile),
                    &BinRecipe::send_video(peer, &profile),
                    &BinRecipe::preview(),
                )?;
                let capture_audio = MediaBin::build(graph, &BinRecipe::capture_audio())?;
                let send_audio = MediaBin::build(graph, &BinRecipe::send_audio(peer, &profile))?;
                capture_audio.link_to(graph, &send_audio)?;

                for node in video.nodes() {
                    self.attribution.insert(node, MediaKind::Video);
                }
                self.register_bin(graph, &video.preview, Surface::Preview);
                self.register_bin(graph, &capture_audio, Surface::Preview);
                self.register_bin(graph, &send_audio, Surface::Preview);

                // the video toggle leaves capture and preview running
                self.branches.push(Branch {
                    kind: MediaKind::Video,
                    nodes: video.send.nodes.clone(),
                    state: BranchState::Stopped,
                });
                let mut audio_nodes = capture_audio.nodes.clone();
                audio_nodes.extend(&send_audio.nodes);
                self.branches.push(Branch {
                    kind: MediaKind::Audio,
                    nodes: audio_nodes,
                    state: BranchState::Stopped,
                });
            }
        }
        Ok(())
    }

    fn register_bin(&mut self, graph: &ElementGraph, bin: &MediaBin, surface: Surface) {
        for node in &bin.nodes {
            self.attribution.insert(*node, bin.kind);
        }
        for sink in bin.render_sinks(graph) {
            self.render_sinks.insert(sink, (bin.kind, surface));
        }
    }

    fn forget_layout(&mut self) {
        self.branches.clear();
        self.attribution.clear();
        self.render_sinks.clear();
        self.render_targets.clear();
    }

    /// Requests PLAYING. Failure does not reach the caller: the session turns
    /// FAULTED and a fault event is queued.
    pub fn start(&mut self) {
        match self.state {
            SessionState::Built | SessionState::Stopped => {}
            SessionState::Playing => {
                log::debug!("{}: already playing", self.name);
                return;
            }
            SessionState::Unbuilt => {
                log::warn!("{}: start requested before build", self.name);
                return;
            }
            SessionState::Faulted => {
                log::warn!("{}: start ignored, session faulted", self.name);
                return;
            }
        }
        let Some(graph) = self.graph.as_mut() else {
            return;
        };

        log::info!("{}: setting pipeline state PLAYING", self.name);
        match graph.set_state(State::Playing) {
            Ok(change) => {
                log::debug!("{}: PLAYING requested ({:?})", self.name, change);
                self.state = SessionState::Playing;
                for branch in &mut self.branches {
                    branch.state = BranchState::Playing;
                }
            }
            Err(e) => self.fault(None, FaultCause::StateChange(e)),
        }
    }

    /// Requests NULL. Never fails from the caller's point of view and is a
    /// no-op when nothing is running.
    pub fn stop(&mut self) {
        match self.state {
            SessionState::Built | SessionState::Playing => {
                log::info!("{}: setting pipeline state NULL", self.name);
                self.force_null();
                self.state = SessionState::Stopped;
            }
            SessionState::Stopped => log::debug!("{}: already stopped", self.name),
            SessionState::Unbuilt | SessionState::Faulted => {}
        }
    }

    fn force_null(&mut self) {
        if let Some(graph) = self.graph.as_mut() {
            if let Err(e) = graph.set_state(State::Null) {
                log::warn!("{}: NULL request failed: {}", self.name, e);
            }
            graph.clear_render_targets();
        }
        for branch in &mut self.branches {
            branch.state = BranchState::Stopped;
        }
        self.render_targets.clear();
        self.ready_tx = None;
    }

    fn fault(&mut self, kind: Option<MediaKind>, cause: FaultCause) {
        log::error!(
            "{}: {} fault: {}",
            self.name,
            kind.map_or_else(|| "pipeline".to_string(), |k| k.to_string()),
            cause
        );
        self.force_null();
        self.state = SessionState::Faulted;
        self.events.push_back(SessionEvent::Faulted { kind, cause });
    }

    /// Flips one media kind's branch between PLAYING and NULL without touching
    /// the other. Only acts while the session is PLAYING.
    pub fn set_branch_playing(&mut self, kind: MediaKind, playing: bool) -> bool {
        if self.state != SessionState::Playing {
            log::debug!(
                "{}: {} toggle ignored in state {}",
                self.name,
                kind,
                self.state
            );
            return false;
        }
        let (Some(graph), Some(branch)) = (
            self.graph.as_mut(),
            self.branches.iter_mut().find(|b| b.kind == kind),
        ) else {
            return false;
        };

        let (target, wanted) = if playing {
            (State::Playing, BranchState::Playing)
        } else {
            (State::Null, BranchState::Stopped)
        };
        if branch.state == wanted {
            return true;
        }

        log::info!("{}: setting {} branch state {}", self.name, kind, target);
        match graph.set_nodes_state(&branch.nodes, target) {
            Ok(_) => {
                branch.state = wanted;
                true
            }
            Err(e) => {
                log::warn!("{}: {} branch refused {}: {}", self.name, kind, target, e);
                false
            }
        }
    }

    /// Hands a window to a render sink. Ignored when the session is no longer
    /// active or the node is not one of its render sinks.
    pub fn assign_render_target(&mut self, node: NodeRef, target: RenderTarget) -> bool {
        if !matches!(self.state, SessionState::Built | SessionState::Playing) {
            log::debug!("{}: render target for inactive session dropped", self.name);
            return false;
        }
        if !self.render_sinks.contains_key(&node) {
            log::debug!("{}: {} is not a render sink", self.name, node);
            return false;
        }
        let Some(graph) = self.graph.as_mut() else {
            return false;
        };
        match graph.set_render_target(node, target) {
            Ok(()) => {
                self.render_targets.insert(node, target);
                true
            }
            Err(e) => {
                log::warn!("{}: render target {} rejected: {}", self.name, target, e);
                false
            }
        }
    }

    pub fn render_target(&self, node: NodeRef) -> Option<RenderTarget> {
        self.render_targets.get(&node).copied()
    }

    /// Feeds one bus message into the state machine. Returns `false` when the
    /// message belongs to another (or a torn-down) graph.
    pub fn handle_bus(&mut self, envelope: &BusEnvelope) -> bool {
        if self.pipeline_id() != Some(envelope.pipeline) {
            return false;
        }

        match &envelope.message {
            BusMessage::StateChanged { node: None, old, new } => {
                log::debug!("{}: pipeline {} -> {}", self.name, old, new);
                if *new >= State::Ready {
                    if let Some(ready) = self.ready_tx.take() {
                        let _ = ready.send(());
                    }
                }
            }
            BusMessage::StateChanged {
                node: Some(node),
                old,
                new,
            } => {
                log::trace!("{}: node {} {} -> {}", self.name, node, old, new);
            }
            BusMessage::Warning { node, reason } => {
                log::warn!("{}: warning from {:?}: {}", self.name, node, reason);
            }
            BusMessage::Error { node, reason } => {
                let Some(kind) = self.attribute(*node) else {
                    return true;
                };
                if !self.is_active() {
                    log::debug!("{}: stale error ignored: {}", self.name, reason);
                    return true;
                }
                self.fault(kind, FaultCause::Runtime(reason.clone()));
            }
            BusMessage::EndOfStream { node } => {
                let Some(kind) = self.attribute(*node) else {
                    return true;
                };
                if self.state != SessionState::Playing {
                    log::debug!("{}: end-of-stream ignored in {}", self.name, self.state);
                    return true;
                }
                log::info!("{}: end of stream", self.name);
                self.force_null();
                self.state = SessionState::Stopped;
                self.events.push_back(SessionEvent::EndOfStream { kind });
            }
            BusMessage::PrepareRenderTarget { node } => self.on_prepare_render_target(*node),
        }
        true
    }

    fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Built | SessionState::Playing)
    }

    /// `Some(None)` for unattributed messages, `None` for nodes that are not
    /// (or no longer) part of the graph.
    fn attribute(&self, node: Option<NodeId>) -> Option<Option<MediaKind>> {
        let Some(node) = node else {
            return Some(None);
        };
        let node = self.graph.as_ref()?.resolve(node)?;
        Some(self.attribution.get(&node).copied())
    }

    fn on_prepare_render_target(&mut self, node: NodeId) {
        if !self.is_active() {
            return;
        }
        let Some(node) = self.graph.as_ref().and_then(|g| g.resolve(node)) else {
            return;
        };
        let Some((kind, surface)) = self.render_sinks.get(&node).copied() else {
            log::debug!("{}: render request from non-render node {}", self.name, node);
            return;
        };

        if let Some(target) = self.render_targets.get(&node).copied() {
            if let Some(graph) = self.graph.as_mut() {
                if let Err(e) = graph.set_render_target(node, target) {
                    log::warn!("{}: reapplying render target failed: {}", self.name, e);
                }
            }
            return;
        }
        self.events
            .push_back(SessionEvent::RenderTargetRequested {
                kind,
                surface,
                node,
            });
    }

    /// Stops and drops the graph, back to UNBUILT.
    pub fn reset(&mut self) {
        self.stop();
        if let Some(mut graph) = self.graph.take() {
            graph.clear();
            log::info!("{}: graph released", self.name);
        }
        self.forget_layout();
        self.ready_tx = None;
        self.ready_rx = None;
        self.events.clear();
        self.state = SessionState::Unbuilt;
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            name: self.name.clone(),
            direction: self.direction(),
            state: self.state,
            peer: self.peer(),
            nodes: self.graph.as_ref().map_or(0, |g| g.node_count()),
            edges: self.graph.as_ref().map_or(0, |g| g.edge_count()),
            branches: self
                .branches
                .iter()
                .map(|b| BranchStatus {
                    kind: b.kind,
                    state: b.state,
                    nodes: b.nodes.len(),
                })
                .collect(),
        }
    }
}

impl Drop for PipelineSession {
    fn drop(&mut self) {
        if self.graph.is_some() {
            self.reset();
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
