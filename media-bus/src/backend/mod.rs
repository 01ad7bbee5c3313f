//! The seam between the graph model and the multimedia framework that actually
//! instantiates elements and moves data.
//!
//! ```text
//!   ElementGraph ──add/link/set_state──► PipelineBackend ──(framework threads)
//!        ▲                                      │
//!        └──────── BusEnvelope (mpsc) ◄─────────┘  state changes, errors, EOS,
//!                                                   render-target requests
//! ```

#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod sim;

use std::fmt::{Display, Formatter};

use crate::{
    element::{NodeId, PipelineId, Properties, State, StateChange},
    error::GraphResult,
};

/// Platform window handle handed out by the UI (an XID, HWND, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTarget(pub usize);

impl Display for RenderTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Asynchronous notification from a running pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusMessage {
    /// `node` is `None` when the pipeline itself changed state.
    StateChanged {
        node: Option<NodeId>,
        old: State,
        new: State,
    },
    Error {
        node: Option<NodeId>,
        reason: String,
    },
    Warning {
        node: Option<NodeId>,
        reason: String,
    },
    EndOfStream {
        node: Option<NodeId>,
    },
    /// A video sink is about to draw and needs a window.
    PrepareRenderTarget {
        node: NodeId,
    },
}

#[derive(Clone, Debug)]
pub struct BusEnvelope {
    pub pipeline: PipelineId,
    pub message: BusMessage,
}

pub type BusReceiver = tokio::sync::mpsc::UnboundedReceiver<BusEnvelope>;

/// Posting side of a pipeline bus. Every message is tagged with the pipeline
/// id so the receiver can drop messages from graphs that no longer exist.
#[derive(Clone, Debug)]
pub struct BusSender {
    pipeline: PipelineId,
    tx: tokio::sync::mpsc::UnboundedSender<BusEnvelope>,
}

impl BusSender {
    pub fn new(pipeline: PipelineId, tx: tokio::sync::mpsc::UnboundedSender<BusEnvelope>) -> Self {
        Self { pipeline, tx }
    }

    pub fn pipeline(&self) -> PipelineId {
        self.pipeline
    }

    pub fn post(&self, message: BusMessage) {
        let envelope = BusEnvelope {
            pipeline: self.pipeline,
            message,
        };
        if self.tx.send(envelope).is_err() {
            log::trace!("bus {}: receiver dropped, message discarded", self.pipeline);
        }
    }
}

/// Which nodes a state request applies to.
#[derive(Clone, Copy, Debug)]
pub enum StateScope<'a> {
    Pipeline,
    Nodes(&'a [NodeId]),
}

/// A multimedia framework able to host pipelines.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_pipeline(&self, name: &str, bus: BusSender) -> GraphResult<Box<dyn PipelineBackend>>;
}

/// One framework pipeline. Dropping it must release every framework resource.
pub trait PipelineBackend: Send {
    fn add_element(&mut self, node: NodeId, factory: &str, properties: &Properties)
    -> GraphResult<()>;

    fn remove_element(&mut self, node: NodeId);

    fn link(&mut self, src: NodeId, sink: NodeId) -> GraphResult<()>;

    fn unlink(&mut self, src: NodeId, sink: NodeId);

    /// Requests a state change. The change may complete later; completion is
    /// reported with [`BusMessage::StateChanged`].
    fn set_state(&mut self, scope: StateScope<'_>, state: State) -> GraphResult<StateChange>;

    fn set_render_target(&mut self, node: NodeId, target: RenderTarget) -> GraphResult<()>;

    /// Forgets every handle given to [`set_render_target`](Self::set_render_target).
    /// Later window requests must be posted again.
    fn clear_render_targets(&mut self);
}
