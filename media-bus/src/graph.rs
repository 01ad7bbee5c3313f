use std::collections::HashMap;

use petgraph::{
    Direction,
    algo::has_path_connecting,
    stable_graph::{EdgeIndex, NodeIndex, StableGraph},
};

use crate::{
    backend::{Backend, BusEnvelope, BusSender, PipelineBackend, RenderTarget, StateScope},
    element::{
        ElementRole, ElementSchema, NodeId, NodeRef, PipelineId, Properties, State, StateChange,
        schema,
    },
    error::{GraphError, GraphResult},
};

/// A processing node owned by exactly one [`ElementGraph`].
#[derive(Debug)]
pub struct Node {
    pub id: NodeRef,
    pub factory: String,
    pub schema: &'static ElementSchema,
    pub properties: Properties,
}

impl Node {
    pub fn label(&self) -> String {
        format!("{}#{}", self.factory, self.id.id)
    }

    pub fn role(&self) -> ElementRole {
        self.schema.role
    }
}

/// Position in a graph's construction history, see [`ElementGraph::rollback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    nodes: usize,
    edges: usize,
}

/// Directed acyclic graph of framework elements backed by one framework pipeline.
///
/// Topology lives in a petgraph `StableGraph`; the insertion logs next to it
/// drive checkpoints and rollback. Node ids are never reused within a graph,
/// so a late bus message can never be attributed to the wrong node.
pub struct ElementGraph {
    id: PipelineId,
    name: String,
    inner: StableGraph<Node, ()>,
    index_map: HashMap<NodeId, NodeIndex>,
    node_log: Vec<NodeIndex>,
    edge_log: Vec<EdgeIndex>,
    next_node: u32,
    backend: Box<dyn PipelineBackend>,
}

impl ElementGraph {
    pub fn new(
        backend: &dyn Backend,
        name: &str,
        bus: tokio::sync::mpsc::UnboundedSender<BusEnvelope>,
    ) -> GraphResult<Self> {
        let id = PipelineId::next();
        let pipeline = backend.create_pipeline(name, BusSender::new(id, bus))?;
        log::debug!("graph {} ({}) created on {}", name, id, backend.name());
        Ok(Self {
            id,
            name: name.to_string(),
            inner: StableGraph::new(),
            index_map: HashMap::new(),
            node_log: Vec::new(),
            edge_log: Vec::new(),
            next_node: 0,
            backend: pipeline,
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.node_log.iter().filter_map(|idx| self.inner.node_weight(*idx))
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    fn index_of(&self, node: NodeRef) -> Option<NodeIndex> {
        if node.pipeline != self.id {
            return None;
        }
        self.index_map.get(&node.id).copied()
    }

    pub fn node(&self, node: NodeRef) -> Option<&Node> {
        self.index_of(node).and_then(|idx| self.inner.node_weight(idx))
    }

    /// Resolves a backend-level node id (as carried by bus messages).
    pub fn resolve(&self, node: NodeId) -> Option<NodeRef> {
        self.index_map.get(&node).map(|idx| self.inner[*idx].id)
    }

    pub fn contains(&self, node: NodeRef) -> bool {
        self.index_of(node).is_some()
    }

    pub fn downstream(&self, node: NodeRef) -> impl Iterator<Item = NodeRef> + '_ {
        self.neighbors(node, Direction::Outgoing)
    }

    pub fn upstream(&self, node: NodeRef) -> impl Iterator<Item = NodeRef> + '_ {
        self.neighbors(node, Direction::Incoming)
    }

    fn neighbors(&self, node: NodeRef, dir: Direction) -> impl Iterator<Item = NodeRef> + '_ {
        self.index_of(node)
            .into_iter()
            .flat_map(move |idx| self.inner.neighbors_directed(idx, dir))
            .map(|idx| self.inner[idx].id)
    }

    /// Registers a node. The factory and every property are checked against the
    /// element catalog before the backend is asked to instantiate anything.
    pub fn add_node(&mut self, factory: &str, properties: Properties) -> GraphResult<NodeRef> {
        let schema = schema(factory)?;
        schema.validate(&properties)?;

        let id = NodeRef {
            pipeline: self.id,
            id: NodeId(self.next_node),
        };
        self.backend.add_element(id.id, factory, &properties)?;
        self.next_node += 1;
        let idx = self.inner.add_node(Node {
            id,
            factory: factory.to_string(),
            schema,
            properties,
        });
        self.index_map.insert(id.id, idx);
        self.node_log.push(idx);
        log::trace!("graph {}: added {}#{}", self.name, factory, id.id);
        Ok(id)
    }

    pub fn link(&mut self, src: NodeRef, sink: NodeRef) -> GraphResult<()> {
        let src_idx = self.index_of(src).ok_or(GraphError::ForeignNode(src))?;
        let sink_idx = self.index_of(sink).ok_or(GraphError::ForeignNode(sink))?;
        let (src_node, sink_node) = (&self.inner[src_idx], &self.inner[sink_idx]);
        let (src_label, sink_label) = (src_node.label(), sink_node.label());

        if src_node.role() == ElementRole::Sink || sink_node.role() == ElementRole::Source {
            return Err(GraphError::IncompatibleLink {
                src: src_label,
                sink: sink_label,
                reason: "pad direction mismatch".to_string(),
            });
        }
        if has_path_connecting(&self.inner, sink_idx, src_idx, None) {
            return Err(GraphError::WouldCycle {
                src: src_label,
                sink: sink_label,
            });
        }
        if src_node.role() != ElementRole::Tee && self.downstream(src).next().is_some() {
            return Err(GraphError::IllegalFanOut(src_label));
        }
        if self.upstream(sink).next().is_some() {
            return Err(GraphError::IncompatibleLink {
                src: src_label,
                sink: sink_label,
                reason: "input already linked".to_string(),
            });
        }

        self.backend.link(src.id, sink.id)?;
        let edge = self.inner.add_edge(src_idx, sink_idx, ());
        self.edge_log.push(edge);
        log::trace!("graph {}: linked {} -> {}", self.name, src_label, sink_label);
        Ok(())
    }

    /// Requests `target` on the whole pipeline. The change is not assumed to be
    /// complete on return; wait for the pipeline-level state-changed message.
    pub fn set_state(&mut self, target: State) -> GraphResult<StateChange> {
        log::debug!("graph {}: requesting {}", self.name, target);
        self.backend.set_state(StateScope::Pipeline, target)
    }

    /// Requests `target` on a subset of nodes, leaving the rest untouched.
    pub fn set_nodes_state(&mut self, nodes: &[NodeRef], target: State) -> GraphResult<StateChange> {
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !self.contains(*node) {
                return Err(GraphError::ForeignNode(*node));
            }
            ids.push(node.id);
        }
        log::debug!(
            "graph {}: requesting {} on {} node(s)",
            self.name,
            target,
            ids.len()
        );
        self.backend.set_state(StateScope::Nodes(&ids), target)
    }

    pub fn set_render_target(&mut self, node: NodeRef, target: RenderTarget) -> GraphResult<()> {
        if !self.contains(node) {
            return Err(GraphError::ForeignNode(node));
        }
        self.backend.set_render_target(node.id, target)
    }

    /// Drops every window handle the backend holds for this pipeline.
    pub fn clear_render_targets(&mut self) {
        self.backend.clear_render_targets();
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            nodes: self.node_log.len(),
            edges: self.edge_log.len(),
        }
    }

    /// Removes every edge and node added after `checkpoint`, newest first.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        while self.edge_log.len() > checkpoint.edges {
            let Some(edge) = self.edge_log.pop() else {
                break;
            };
            if let Some((src, sink)) = self.inner.edge_endpoints(edge) {
                let (src, sink) = (self.inner[src].id.id, self.inner[sink].id.id);
                self.inner.remove_edge(edge);
                self.backend.unlink(src, sink);
            }
        }
        while self.node_log.len() > checkpoint.nodes {
            let Some(idx) = self.node_log.pop() else {
                break;
            };
            if let Some(node) = self.inner.remove_node(idx) {
                self.index_map.remove(&node.id.id);
                self.backend.remove_element(node.id.id);
                log::trace!("graph {}: removed {}", self.name, node.label());
            }
        }
    }

    /// Removes every node and edge.
    pub fn clear(&mut self) {
        self.rollback(Checkpoint { nodes: 0, edges: 0 });
    }
}

impl std::fmt::Debug for ElementGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementGraph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("nodes", &self.inner.node_count())
            .field("edges", &self.inner.edge_count())
            .finish()
    }
}

#[cfg(test)]
#[path = "graph_test.rs"]
mod graph_test;
