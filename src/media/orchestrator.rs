//! Control loop owning the incoming and the outgoing pipeline session.
//!
//! ```text
//!  API / UI / signaling ──command──►┐
//!  settle timer, window answers ───►├─► inner_loop ──► PipelineSession (in, out)
//!  pipeline buses ──BusEnvelope───►┘          │
//!                                             └──► UiEvent / Signaling
//! ```

use std::{net::IpAddr, sync::Arc, time::Duration};

use media_bus::{
    backend::{Backend, BusEnvelope, BusReceiver, RenderTarget},
    bins::MediaKind,
    element::{NodeRef, PipelineId},
    profile::WireProfile,
    session::{Direction, PipelineSession, SessionEvent, SessionPlan, SessionState},
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    media::types::{OrchestratorStatus, RenderTargetRequest, SignalEvent, UiEvent},
    signal::{AddressResolver, Signaling},
};

pub struct OrchestratorOptions {
    pub nick: String,
    /// Joining an already shared activity.
    pub shared: bool,
    /// Upper bound on waiting for a fresh outgoing graph before starting it.
    pub settle_timeout: Duration,
    pub profile: WireProfile,
    pub local_address: AddressResolver,
}

/// Limits how often this peer proactively announces its address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnnounceBudget(u8);

impl AnnounceBudget {
    /// One announcement when joining a shared session, two otherwise.
    pub fn new(shared: bool) -> Self {
        Self(if shared { 1 } else { 2 })
    }

    pub fn remaining(&self) -> u8 {
        self.0
    }

    pub fn is_spent(&self) -> bool {
        self.0 == 0
    }

    fn spend(&mut self) {
        self.0 = self.0.saturating_sub(1);
    }
}

pub struct MediaOrchestrator {
    cancel: CancellationToken,
    tx: mpsc::Sender<OrchestratorCommand>,
}

impl MediaOrchestrator {
    pub fn new(
        backend: Arc<dyn Backend>,
        signaling: Arc<dyn Signaling>,
        ui: mpsc::UnboundedSender<UiEvent>,
        options: OrchestratorOptions,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let state = OrchestratorState {
            backend,
            signaling,
            ui,
            budget: AnnounceBudget::new(options.shared),
            options,
            bus: bus_tx,
            internal: internal_tx,
            incoming: None,
            outgoing: None,
            shut_down: false,
        };

        let cancel_clone = cancel.clone();
        tokio::spawn(
            async move { Self::inner_loop(cancel_clone, state, rx, bus_rx, internal_rx).await },
        );
        Self { cancel, tx }
    }

    async fn inner_loop(
        cancel: CancellationToken,
        mut state: OrchestratorState,
        mut rx: mpsc::Receiver<OrchestratorCommand>,
        mut bus_rx: BusReceiver,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break;
                },
                Some(envelope) = bus_rx.recv() => {
                    state.on_bus(envelope);
                },
                Some(internal) = internal_rx.recv() => {
                    state.on_internal(internal);
                },
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    if let Err(e) = Self::inner_command_handler(&mut state, cmd) {
                        log::error!("orchestrator command error: {:#}", e);
                    }
                },
            }
        }
        state.shutdown();
        log::debug!("orchestrator loop exited");
    }

    fn inner_command_handler(
        state: &mut OrchestratorState,
        cmd: OrchestratorCommand,
    ) -> anyhow::Result<()> {
        if state.shut_down && !matches!(cmd, OrchestratorCommand::Shutdown { .. }) {
            return cmd.reject();
        }

        match cmd {
            OrchestratorCommand::BuildIncoming { result } => {
                result.send(state.build_incoming()).map_err(reply_failed)
            }
            OrchestratorCommand::StartIncoming { result } => result
                .send(state.start(Direction::Incoming))
                .map_err(reply_failed),
            OrchestratorCommand::StopIncoming { result } => result
                .send(state.stop(Direction::Incoming))
                .map_err(reply_failed),
            OrchestratorCommand::StartOutgoing { result } => result
                .send(state.start(Direction::Outgoing))
                .map_err(reply_failed),
            OrchestratorCommand::StopOutgoing { result } => result
                .send(state.stop(Direction::Outgoing))
                .map_err(reply_failed),
            OrchestratorCommand::Signal { event, result } => result
                .send(state.handle_signal(event))
                .map_err(reply_failed),
            OrchestratorCommand::ToggleOutgoing {
                kind,
                enable,
                result,
            } => result
                .send(Ok(state.toggle_outgoing(kind, enable)))
                .map_err(reply_failed),
            OrchestratorCommand::SendChat { text, result } => {
                result.send(state.send_chat(&text)).map_err(reply_failed)
            }
            OrchestratorCommand::Status { result } => {
                result.send(Ok(state.status())).map_err(reply_failed)
            }
            OrchestratorCommand::Shutdown { result } => {
                state.shutdown();
                result.send(Ok(())).map_err(reply_failed)
            }
        }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<anyhow::Result<T>>) -> OrchestratorCommand,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow::anyhow!("orchestrator is not running"))?;
        rx.await?
    }

    /// Builds the one incoming session. Later calls are no-ops.
    pub async fn build_incoming(&self) -> anyhow::Result<()> {
        self.call(|result| OrchestratorCommand::BuildIncoming { result })
            .await
    }

    pub async fn start_incoming(&self) -> anyhow::Result<()> {
        self.call(|result| OrchestratorCommand::StartIncoming { result })
            .await
    }

    pub async fn stop_incoming(&self) -> anyhow::Result<()> {
        self.call(|result| OrchestratorCommand::StopIncoming { result })
            .await
    }

    pub async fn start_outgoing(&self) -> anyhow::Result<()> {
        self.call(|result| OrchestratorCommand::StartOutgoing { result })
            .await
    }

    pub async fn stop_outgoing(&self) -> anyhow::Result<()> {
        self.call(|result| OrchestratorCommand::StopOutgoing { result })
            .await
    }

    /// Builds the outgoing session towards `ip` and schedules its start, unless
    /// one exists already.
    pub async fn on_peer_ip_announced(&self, ip: IpAddr) -> anyhow::Result<()> {
        self.handle_signal(SignalEvent::PeerIpAnnounced { ip })
            .await
    }

    pub async fn on_join_requested(&self) -> anyhow::Result<()> {
        self.handle_signal(SignalEvent::JoinRequested).await
    }

    pub async fn handle_signal(&self, event: SignalEvent) -> anyhow::Result<()> {
        self.call(|result| OrchestratorCommand::Signal { event, result })
            .await
    }

    /// Returns whether the video branch was switched.
    pub async fn toggle_outgoing_video(&self, enable: bool) -> anyhow::Result<bool> {
        self.toggle_outgoing(MediaKind::Video, enable).await
    }

    pub async fn toggle_outgoing_audio(&self, enable: bool) -> anyhow::Result<bool> {
        self.toggle_outgoing(MediaKind::Audio, enable).await
    }

    async fn toggle_outgoing(&self, kind: MediaKind, enable: bool) -> anyhow::Result<bool> {
        self.call(|result| OrchestratorCommand::ToggleOutgoing {
            kind,
            enable,
            result,
        })
        .await
    }

    /// Returns `false` when nothing was sent (empty text or no peer connection).
    pub async fn send_chat(&self, text: &str) -> anyhow::Result<bool> {
        let text = text.to_string();
        self.call(|result| OrchestratorCommand::SendChat { text, result })
            .await
    }

    pub async fn status(&self) -> anyhow::Result<OrchestratorStatus> {
        self.call(|result| OrchestratorCommand::Status { result })
            .await
    }

    /// Stops outgoing, then incoming, and releases both graphs. Safe to call
    /// any number of times.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.call(|result| OrchestratorCommand::Shutdown { result })
            .await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MediaOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reply_failed<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("command caller went away")
}

enum OrchestratorCommand {
    BuildIncoming {
        result: oneshot::Sender<anyhow::Result<()>>,
    },
    StartIncoming {
        result: oneshot::Sender<anyhow::Result<()>>,
    },
    StopIncoming {
        result: oneshot::Sender<anyhow::Result<()>>,
    },
    StartOutgoing {
        result: oneshot::Sender<anyhow::Result<()>>,
    },
    StopOutgoing {
        result: oneshot::Sender<anyhow::Result<()>>,
    },
    Signal {
        event: SignalEvent,
        result: oneshot::Sender<anyhow::Result<()>>,
    },
    ToggleOutgoing {
        kind: MediaKind,
        enable: bool,
        result: oneshot::Sender<anyhow::Result<bool>>,
    },
    SendChat {
        text: String,
        result: oneshot::Sender<anyhow::Result<bool>>,
    },
    Status {
        result: oneshot::Sender<anyhow::Result<OrchestratorStatus>>,
    },
    Shutdown {
        result: oneshot::Sender<anyhow::Result<()>>,
    },
}

impl OrchestratorCommand {
    fn reject(self) -> anyhow::Result<()> {
        let err = || anyhow::anyhow!("orchestrator shut down");
        // a dropped reply channel surfaces as an error on the caller side anyway
        let _ = match self {
            OrchestratorCommand::BuildIncoming { result }
            | OrchestratorCommand::StartIncoming { result }
            | OrchestratorCommand::StopIncoming { result }
            | OrchestratorCommand::StartOutgoing { result }
            | OrchestratorCommand::StopOutgoing { result }
            | OrchestratorCommand::Signal { result, .. }
            | OrchestratorCommand::Shutdown { result } => result.send(Err(err())).is_ok(),
            OrchestratorCommand::ToggleOutgoing { result, .. }
            | OrchestratorCommand::SendChat { result, .. } => result.send(Err(err())).is_ok(),
            OrchestratorCommand::Status { result } => result.send(Err(err())).is_ok(),
        };
        Ok(())
    }
}

/// Loop-internal messages produced by helper tasks.
enum Internal {
    /// The readiness wait of a freshly built outgoing graph is over.
    SettleElapsed {
        pipeline: PipelineId,
        timed_out: bool,
    },
    /// The UI answered a render-target request.
    AssignRenderTarget {
        direction: Direction,
        pipeline: PipelineId,
        node: NodeRef,
        target: RenderTarget,
    },
}

struct OrchestratorState {
    backend: Arc<dyn Backend>,
    signaling: Arc<dyn Signaling>,
    ui: mpsc::UnboundedSender<UiEvent>,
    options: OrchestratorOptions,
    budget: AnnounceBudget,
    bus: mpsc::UnboundedSender<BusEnvelope>,
    internal: mpsc::UnboundedSender<Internal>,
    incoming: Option<PipelineSession>,
    outgoing: Option<PipelineSession>,
    shut_down: bool,
}

impl OrchestratorState {
    fn session_mut(&mut self, direction: Direction) -> Option<&mut PipelineSession> {
        match direction {
            Direction::Incoming => self.incoming.as_mut(),
            Direction::Outgoing => self.outgoing.as_mut(),
        }
    }

    fn build_incoming(&mut self) -> anyhow::Result<()> {
        if self
            .incoming
            .as_ref()
            .is_some_and(|s| s.state() != SessionState::Unbuilt)
        {
            log::warn!("incoming pipeline exists, not building another");
            return Ok(());
        }
        let plan = SessionPlan::Incoming {
            profile: self.options.profile.clone(),
        };
        let bus = self.bus.clone();
        let session = self
            .incoming
            .get_or_insert_with(|| PipelineSession::new("incoming", plan, bus));
        session
            .build(self.backend.as_ref())
            .map_err(|e| anyhow::anyhow!("building incoming pipeline: {}", e))
    }

    /// Starts a built or stopped session. A faulted session is torn down and
    /// rebuilt from its plan first, so it keeps its peer.
    fn start(&mut self, direction: Direction) -> anyhow::Result<()> {
        let backend = Arc::clone(&self.backend);
        let session = self
            .session_mut(direction)
            .ok_or_else(|| anyhow::anyhow!("no {} pipeline", direction))?;
        match session.state() {
            SessionState::Unbuilt => {
                return Err(anyhow::anyhow!("{} pipeline is not built", direction));
            }
            SessionState::Faulted => {
                log::info!("{}: rebuilding faulted pipeline", direction);
                session.reset();
                session
                    .build(backend.as_ref())
                    .map_err(|e| anyhow::anyhow!("rebuilding {} pipeline: {}", direction, e))?;
            }
            _ => {}
        }
        session.start();
        let state = session.state();
        self.dispatch_events(direction);
        if state != SessionState::Playing {
            return Err(anyhow::anyhow!("{} pipeline did not start ({})", direction, state));
        }
        Ok(())
    }

    fn stop(&mut self, direction: Direction) -> anyhow::Result<()> {
        let session = self
            .session_mut(direction)
            .ok_or_else(|| anyhow::anyhow!("no {} pipeline", direction))?;
        session.stop();
        self.dispatch_events(direction);
        Ok(())
    }

    fn handle_signal(&mut self, event: SignalEvent) -> anyhow::Result<()> {
        log::debug!("signal: {}", event);
        match event {
            SignalEvent::PeerIpAnnounced { ip } => self.on_peer_ip_announced(ip),
            SignalEvent::JoinRequested => {
                self.on_join_requested();
                Ok(())
            }
            SignalEvent::BuddyJoined { name } => {
                self.chat(format!("{} has joined the chat", name));
                Ok(())
            }
            SignalEvent::BuddyLeft { name } => {
                self.chat(format!("{} has left the chat", name));
                Ok(())
            }
            SignalEvent::ChatMessageReceived { sender, text } => {
                log::trace!("chat line from {}", sender);
                self.chat(text);
                Ok(())
            }
        }
    }

    fn on_peer_ip_announced(&mut self, ip: IpAddr) -> anyhow::Result<()> {
        match self.outgoing.as_mut() {
            Some(session) if session.state() == SessionState::Faulted => {
                log::info!(
                    "{} has sent its ip, rebuilding faulted outgoing pipeline to {:?}",
                    ip,
                    session.peer()
                );
                session.reset();
            }
            Some(session) if session.state() != SessionState::Unbuilt => {
                log::info!("{} has sent its ip, ignoring as we are already streaming", ip);
                return Ok(());
            }
            Some(session) if session.peer() != Some(ip) => {
                log::info!(
                    "{} has sent its ip, retrying outgoing build for {:?}",
                    ip,
                    session.peer()
                );
            }
            Some(_) => {}
            None => log::info!("building outgoing pipeline to {}", ip),
        }

        let plan = SessionPlan::Outgoing {
            peer: ip,
            profile: self.options.profile.clone(),
        };
        let bus = self.bus.clone();
        let session = self
            .outgoing
            .get_or_insert_with(|| PipelineSession::new("outgoing", plan, bus));
        session
            .build(self.backend.as_ref())
            .map_err(|e| anyhow::anyhow!("building outgoing pipeline: {}", e))?;
        let Some(pipeline) = session.pipeline_id() else {
            return Ok(());
        };
        let ready = session.take_ready();
        let internal = self.internal.clone();
        let timeout = self.options.settle_timeout;
        tokio::spawn(async move {
            let timed_out = match ready {
                Some(ready) => tokio::time::timeout(timeout, ready).await.is_err(),
                None => false,
            };
            let _ = internal.send(Internal::SettleElapsed {
                pipeline,
                timed_out,
            });
        });
        Ok(())
    }

    fn on_join_requested(&mut self) -> bool {
        if !self.signaling.is_connected() {
            log::debug!("join request without a signaling channel");
            return false;
        }
        if self.budget.is_spent() {
            log::debug!("join request ignored, address already announced");
            return false;
        }
        let ip = match (self.options.local_address)() {
            Ok(ip) => ip,
            Err(e) => {
                log::warn!("{:#}", e);
                return false;
            }
        };
        self.budget.spend();
        if let Err(e) = self.signaling.announce_ip(ip) {
            log::warn!("announcing {} failed: {:#}", ip, e);
        }
        true
    }

    fn toggle_outgoing(&mut self, kind: MediaKind, enable: bool) -> bool {
        match self.outgoing.as_mut() {
            Some(session) => session.set_branch_playing(kind, enable),
            None => {
                log::debug!("no outgoing pipeline, {} toggle ignored", kind);
                false
            }
        }
    }

    fn send_chat(&mut self, text: &str) -> anyhow::Result<bool> {
        if text.trim().is_empty() || !self.signaling.is_connected() {
            return Ok(false);
        }
        let line = format!("<{}> {}", self.options.nick, text);
        self.signaling.send_chat(&self.options.nick, &line)?;
        Ok(true)
    }

    fn chat(&self, line: String) {
        if self.ui.send(UiEvent::Chat(line)).is_err() {
            log::trace!("ui gone, chat line dropped");
        }
    }

    fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            incoming: self.incoming.as_ref().map(|s| s.status()),
            outgoing: self.outgoing.as_ref().map(|s| s.status()),
            announce_budget: self.budget.remaining(),
            shut_down: self.shut_down,
        }
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        log::info!("shutting down media sessions");
        for direction in [Direction::Outgoing, Direction::Incoming] {
            if let Some(session) = self.session_mut(direction) {
                session.stop();
                session.reset();
            }
        }
        self.shut_down = true;
    }

    fn on_bus(&mut self, envelope: BusEnvelope) {
        for direction in [Direction::Incoming, Direction::Outgoing] {
            let handled = self
                .session_mut(direction)
                .is_some_and(|s| s.handle_bus(&envelope));
            if handled {
                self.dispatch_events(direction);
                return;
            }
        }
        log::trace!("bus message from released pipeline {}", envelope.pipeline);
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::SettleElapsed {
                pipeline,
                timed_out,
            } => {
                let Some(session) = self.outgoing.as_mut() else {
                    return;
                };
                if session.pipeline_id() != Some(pipeline) || session.state() != SessionState::Built {
                    log::debug!("scheduled outgoing start skipped ({})", session.state());
                    return;
                }
                if timed_out {
                    log::warn!("outgoing pipeline not ready in time, starting anyway");
                }
                session.start();
                self.dispatch_events(Direction::Outgoing);
            }
            Internal::AssignRenderTarget {
                direction,
                pipeline,
                node,
                target,
            } => {
                let Some(session) = self.session_mut(direction) else {
                    return;
                };
                if session.pipeline_id() != Some(pipeline) {
                    log::debug!("render target for released {} pipeline dropped", direction);
                    return;
                }
                session.assign_render_target(node, target);
            }
        }
    }

    /// Turns session events into UI events. Unattributed notifications are
    /// reported for every media kind the session carries.
    fn dispatch_events(&mut self, direction: Direction) {
        let Some(session) = self.session_mut(direction) else {
            return;
        };
        let events = session.take_events();
        let kinds = session.kinds();
        let pipeline = session.pipeline_id();
        let of = |kind: Option<MediaKind>| match kind {
            Some(kind) => vec![kind],
            None if kinds.is_empty() => MediaKind::ALL.to_vec(),
            None => kinds.clone(),
        };

        for event in events {
            match event {
                SessionEvent::Faulted { kind, cause } => {
                    for kind in of(kind) {
                        self.emit(UiEvent::StreamFaulted {
                            direction,
                            kind,
                            reason: cause.to_string(),
                        });
                    }
                }
                SessionEvent::EndOfStream { kind } => {
                    for kind in of(kind) {
                        self.emit(UiEvent::StreamEnded { direction, kind });
                    }
                }
                SessionEvent::RenderTargetRequested {
                    kind,
                    surface,
                    node,
                } => {
                    let Some(pipeline) = pipeline else {
                        continue;
                    };
                    let (request, answer) = RenderTargetRequest::new(direction, kind, surface);
                    self.emit(UiEvent::RenderTargetRequested(request));
                    let internal = self.internal.clone();
                    tokio::spawn(async move {
                        if let Ok(target) = answer.await {
                            let _ = internal.send(Internal::AssignRenderTarget {
                                direction,
                                pipeline,
                                node,
                                target,
                            });
                        }
                    });
                }
            }
        }
    }

    fn emit(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            log::trace!("ui gone, event dropped");
        }
    }
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod orchestrator_test;
