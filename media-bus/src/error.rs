use crate::element::{NodeRef, PropertyKind, State};

/// Build-time and control-time failures of an [`ElementGraph`](crate::graph::ElementGraph).
///
/// Everything here is returned synchronously to the caller. Runtime faults
/// travel over the bus instead, see [`BusMessage`](crate::backend::BusMessage).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("unknown element type `{0}`")]
    UnknownElementType(String),

    #[error("element `{element}` has no property `{property}`")]
    UnknownProperty { element: String, property: String },

    #[error("property `{property}` of `{element}` expects {expected}, got {actual}")]
    PropertyType {
        element: String,
        property: String,
        expected: PropertyKind,
        actual: PropertyKind,
    },

    #[error("cannot link `{src}` to `{sink}`: {reason}")]
    IncompatibleLink {
        src: String,
        sink: String,
        reason: String,
    },

    #[error("bin `{0}` has no elements")]
    EmptyBin(String),

    #[error("node {0} does not belong to this graph")]
    ForeignNode(NodeRef),

    #[error("`{0}` already feeds a consumer and is not a branch point")]
    IllegalFanOut(String),

    #[error("linking `{src}` to `{sink}` would create a cycle")]
    WouldCycle { src: String, sink: String },

    #[error("branch point `{tee}` linked {linked} of {expected} consumers")]
    IncompleteBranch {
        tee: String,
        linked: usize,
        expected: usize,
    },

    #[error("state change to {target} failed: {reason}")]
    AsyncStateChangeFailed { target: State, reason: String },

    #[error("backend error: {0}")]
    Backend(String),
}

pub type GraphResult<T> = Result<T, GraphError>;
