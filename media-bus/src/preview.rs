use crate::{
    bins::{BinRecipe, MediaBin},
    element::{NodeRef, Properties},
    error::{GraphError, GraphResult},
    graph::ElementGraph,
};

/// One capture source duplicated into a transmit chain and a local render chain.
///
/// ```text
///                               ┌─► send (encode ─► pay ─► udpsink)
/// capture ─► tee ───────────────┤
///                               └─► preview (queue ─► convert ─► render)
/// ```
#[derive(Clone, Debug)]
pub struct PreviewBranch {
    pub capture: MediaBin,
    pub tee: NodeRef,
    pub send: MediaBin,
    pub preview: MediaBin,
}

impl PreviewBranch {
    pub const CONSUMERS: usize = 2;

    /// Builds capture, branch point and both consumers. Either everything is
    /// linked or nothing from this call is left in `graph`.
    pub fn build(
        graph: &mut ElementGraph,
        capture: &BinRecipe,
        send: &BinRecipe,
        preview: &BinRecipe,
    ) -> GraphResult<Self> {
        let checkpoint = graph.checkpoint();
        match Self::build_linked(graph, capture, send, preview) {
            Ok(branch) => Ok(branch),
            Err(e) => {
                log::warn!("graph {}: preview branch failed: {}", graph.name(), e);
                graph.rollback(checkpoint);
                Err(e)
            }
        }
    }

    fn build_linked(
        graph: &mut ElementGraph,
        capture: &BinRecipe,
        send: &BinRecipe,
        preview: &BinRecipe,
    ) -> GraphResult<Self> {
        let capture = MediaBin::build(graph, capture)?;
        let tee = graph.add_node("tee", Properties::new())?;
        let exit = capture.exit.ok_or_else(|| GraphError::IncompatibleLink {
            src: capture.name.clone(),
            sink: "tee".to_string(),
            reason: "capture bin has no output".to_string(),
        })?;
        graph.link(exit, tee)?;

        let send = MediaBin::build(graph, send)?;
        Self::attach(graph, tee, &send)?;
        let preview = MediaBin::build(graph, preview)?;
        Self::attach(graph, tee, &preview)?;

        let linked = graph.downstream(tee).count();
        if linked != Self::CONSUMERS {
            return Err(GraphError::IncompleteBranch {
                tee: format!("tee#{}", tee.id),
                linked,
                expected: Self::CONSUMERS,
            });
        }

        Ok(Self {
            capture,
            tee,
            send,
            preview,
        })
    }

    fn attach(graph: &mut ElementGraph, tee: NodeRef, consumer: &MediaBin) -> GraphResult<()> {
        match consumer.entry {
            Some(entry) => graph.link(tee, entry),
            None => Err(GraphError::IncompleteBranch {
                tee: format!("tee#{}", tee.id),
                linked: graph.downstream(tee).count(),
                expected: Self::CONSUMERS,
            }),
        }
    }

    /// Every node of the branch, capture first.
    pub fn nodes(&self) -> Vec<NodeRef> {
        let mut nodes = self.capture.nodes.clone();
        nodes.push(self.tee);
        nodes.extend(&self.send.nodes);
        nodes.extend(&self.preview.nodes);
        nodes
    }
}

#[cfg(test)]
#[path = "preview_test.rs"]
mod preview_test;
