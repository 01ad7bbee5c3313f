use std::net::{IpAddr, Ipv4Addr};

use tokio::sync::mpsc;

use super::PreviewBranch;
use crate::{
    backend::sim::SimBackend,
    bins::BinRecipe,
    element::ElementRole,
    error::GraphError,
    graph::ElementGraph,
    profile::WireProfile,
};

const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

fn build(sim: &SimBackend) -> (ElementGraph, Result<PreviewBranch, GraphError>) {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut g = ElementGraph::new(sim, "preview", tx).unwrap();
    let profile = WireProfile::default();
    let branch = PreviewBranch::build(
        &mut g,
        &BinRecipe::capture_video(&profile),
        &BinRecipe::send_video(PEER, &profile),
        &BinRecipe::preview(),
    );
    (g, branch)
}

#[test]
fn test_tee_feeds_both_consumers() {
    let sim = SimBackend::new();
    let (g, branch) = build(&sim);
    let branch = branch.unwrap();

    let consumers: Vec<_> = g.downstream(branch.tee).collect();
    assert_eq!(consumers.len(), PreviewBranch::CONSUMERS);
    assert!(consumers.contains(&branch.send.nodes[0]));
    assert!(consumers.contains(&branch.preview.nodes[0]));
    assert_eq!(g.node(branch.tee).map(|n| n.role()), Some(ElementRole::Tee));

    // 3 capture + tee + 3 send + 3 preview
    assert_eq!(branch.nodes().len(), 10);
    assert_eq!(g.node_count(), 10);
    assert_eq!(g.edge_count(), 9);
    assert!(branch.send.is_well_formed(&g));
    assert!(branch.preview.is_well_formed(&g));
}

#[test]
fn test_only_preview_renders() {
    let sim = SimBackend::new();
    let (g, branch) = build(&sim);
    let branch = branch.unwrap();

    assert!(branch.send.render_sinks(&g).is_empty());
    assert_eq!(branch.preview.render_sinks(&g).len(), 1);
}

#[test]
fn test_failed_consumer_link_rolls_back_everything() {
    let sim = SimBackend::new();
    sim.reject_link("tee", "queue");
    let (g, branch) = build(&sim);

    let err = branch.unwrap_err();
    assert!(matches!(err, GraphError::IncompatibleLink { ref src, .. } if src == "tee"));
    assert_eq!(g.node_count(), 0);
    assert_eq!(g.edge_count(), 0);
    assert_eq!(sim.element_count("preview"), 0);
    assert_eq!(sim.link_count("preview"), 0);
}

#[test]
fn test_failed_encoder_rolls_back_capture() {
    let sim = SimBackend::new();
    sim.missing_factory("rtptheorapay");
    let (g, branch) = build(&sim);

    assert_eq!(
        branch.unwrap_err(),
        GraphError::UnknownElementType("rtptheorapay".to_string())
    );
    assert_eq!(g.node_count(), 0);
}

#[test]
fn test_sink_only_consumer_is_incomplete() {
    let sim = SimBackend::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut g = ElementGraph::new(&sim, "preview", tx).unwrap();
    let profile = WireProfile::default();
    let sourced = BinRecipe::receive_audio(&profile);

    let err = PreviewBranch::build(
        &mut g,
        &BinRecipe::capture_video(&profile),
        &BinRecipe::send_video(PEER, &profile),
        &sourced,
    )
    .unwrap_err();
    assert!(matches!(err, GraphError::IncompleteBranch { linked: 1, expected: 2, .. }));
    assert_eq!(g.node_count(), 0);
}
