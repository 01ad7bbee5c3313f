use std::net::{IpAddr, Ipv4Addr};

use tokio::sync::mpsc;

use super::{BinRecipe, MediaBin, MediaKind};
use crate::{
    backend::sim::SimBackend,
    element::{Properties, PropertyValue},
    error::GraphError,
    graph::ElementGraph,
    profile::WireProfile,
};

const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7));

fn graph(sim: &SimBackend) -> ElementGraph {
    let (tx, _rx) = mpsc::unbounded_channel();
    ElementGraph::new(sim, "bins", tx).unwrap()
}

#[test]
fn test_send_video_recipe() {
    let recipe = BinRecipe::send_video(PEER, &WireProfile::default());
    let factories: Vec<_> = recipe.elements.iter().map(|e| e.factory).collect();
    assert_eq!(factories, vec!["theoraenc", "rtptheorapay", "udpsink"]);

    let enc = &recipe.elements[0].properties;
    assert_eq!(enc.get("bitrate"), Some(&PropertyValue::Int(50)));
    assert_eq!(enc.get("speed-level"), Some(&PropertyValue::Int(2)));
    let sink = &recipe.elements[2].properties;
    assert_eq!(sink.get("host").and_then(|v| v.as_str()), Some("192.168.1.7"));
    assert_eq!(sink.get("port").and_then(|v| v.as_int()), Some(5004));
}

#[test]
fn test_receive_recipes_listen_on_fixed_ports() {
    let profile = WireProfile::default();
    let video = BinRecipe::receive_video(&profile);
    let audio = BinRecipe::receive_audio(&profile);

    assert_eq!(video.elements[0].factory, "udpsrc");
    assert_eq!(
        video.elements[0].properties.get("port").and_then(|v| v.as_int()),
        Some(5004)
    );
    assert_eq!(
        audio.elements[0].properties.get("port").and_then(|v| v.as_int()),
        Some(5005)
    );
    assert_eq!(video.elements.last().map(|e| e.factory), Some("autovideosink"));
    assert_eq!(audio.elements.last().map(|e| e.factory), Some("autoaudiosink"));
}

#[test]
fn test_build_links_in_sequence() {
    let sim = SimBackend::new();
    let mut g = graph(&sim);
    let bin = MediaBin::build(&mut g, &BinRecipe::receive_video(&WireProfile::default())).unwrap();

    assert_eq!(bin.kind, MediaKind::Video);
    assert_eq!(bin.nodes.len(), 5);
    assert_eq!(g.edge_count(), 4);
    // source first, sink last: no free pads
    assert_eq!(bin.entry, None);
    assert_eq!(bin.exit, None);
    assert!(bin.is_well_formed(&g));
    assert_eq!(bin.render_sinks(&g), vec![bin.nodes[4]]);
}

#[test]
fn test_open_ended_bins_link_together() {
    let sim = SimBackend::new();
    let mut g = graph(&sim);
    let profile = WireProfile::default();
    let capture = MediaBin::build(&mut g, &BinRecipe::capture_audio()).unwrap();
    let send = MediaBin::build(&mut g, &BinRecipe::send_audio(PEER, &profile)).unwrap();

    assert_eq!(capture.entry, None);
    assert_eq!(capture.exit, capture.nodes.first().copied());
    assert_eq!(send.entry, send.nodes.first().copied());
    capture.link_to(&mut g, &send).unwrap();
    assert_eq!(g.edge_count(), 3);
    assert!(send.render_sinks(&g).is_empty());

    let err = send.link_to(&mut g, &capture).unwrap_err();
    assert!(matches!(err, GraphError::IncompatibleLink { ref reason, .. } if reason == "bin has no free pad"));
}

#[test]
fn test_empty_recipe() {
    let sim = SimBackend::new();
    let mut g = graph(&sim);
    let err = MediaBin::build(&mut g, &BinRecipe::new("nothing", MediaKind::Audio)).unwrap_err();
    assert_eq!(err, GraphError::EmptyBin("nothing".to_string()));
}

#[test]
fn test_failed_build_leaves_nothing() {
    let sim = SimBackend::new();
    sim.missing_factory("theoradec");
    let mut g = graph(&sim);
    let existing = g.add_node("fakesink", Properties::new()).unwrap();

    let err = MediaBin::build(&mut g, &BinRecipe::receive_video(&WireProfile::default())).unwrap_err();
    assert_eq!(err, GraphError::UnknownElementType("theoradec".to_string()));
    assert_eq!(g.node_count(), 1);
    assert_eq!(g.edge_count(), 0);
    assert!(g.contains(existing));
    assert_eq!(sim.element_count("bins"), 1);
}

#[test]
fn test_bad_property_rejected_before_backend() {
    let sim = SimBackend::new();
    let mut g = graph(&sim);
    let recipe = BinRecipe::new("bad", MediaKind::Video)
        .element("videotestsrc", Properties::new())
        .element("theoraenc", Properties::new().with("bitrate", "fast"));

    let err = MediaBin::build(&mut g, &recipe).unwrap_err();
    assert!(matches!(err, GraphError::PropertyType { ref property, .. } if property == "bitrate"));
    assert_eq!(g.node_count(), 0);
    assert_eq!(sim.element_count("bins"), 0);
}
