//! Reusable sub-graph recipes.
//!
//! ```text
//! capture video : autovideosrc ─► videorate ─► capsfilter ─► (branch point)
//! send video    : theoraenc ─► rtptheorapay ─► udpsink(peer:5004)
//! capture audio : autoaudiosrc
//! send audio    : speexenc ─► rtpspeexpay ─► udpsink(peer:5005)
//! recv video    : udpsrc(:5004) ─► rtptheoradepay ─► theoradec ─► videoconvert ─► autovideosink
//! recv audio    : udpsrc(:5005) ─► rtpspeexdepay ─► speexdec ─► autoaudiosink
//! preview       : queue ─► videoconvert ─► ximagesink
//! ```

use std::{
    fmt::{Display, Formatter},
    net::IpAddr,
};

use serde::{Deserialize, Serialize};

use crate::{
    element::{ElementRole, NodeRef, Properties},
    error::{GraphError, GraphResult},
    graph::ElementGraph,
    profile::WireProfile,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

/// Where a video render sink draws.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    /// Local camera preview.
    Preview,
    /// Video received from the peer.
    Remote,
}

impl Display for Surface {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Surface::Preview => f.write_str("preview"),
            Surface::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementDecl {
    pub factory: &'static str,
    pub properties: Properties,
}

/// Declarative bin: elements linked strictly in sequence from entry to exit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinRecipe {
    pub name: String,
    pub kind: MediaKind,
    pub elements: Vec<ElementDecl>,
}

impl BinRecipe {
    pub fn new(name: &str, kind: MediaKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            elements: Vec::new(),
        }
    }

    pub fn element(mut self, factory: &'static str, properties: Properties) -> Self {
        self.elements.push(ElementDecl {
            factory,
            properties,
        });
        self
    }

    pub fn capture_video(profile: &WireProfile) -> Self {
        Self::new("capture-video", MediaKind::Video)
            .element("autovideosrc", Properties::new())
            .element(
                "videorate",
                Properties::new().with("max-rate", profile.framerate),
            )
            .element(
                "capsfilter",
                Properties::new().with_caps("caps", profile.capture_caps()),
            )
    }

    pub fn capture_audio() -> Self {
        Self::new("capture-audio", MediaKind::Audio).element("autoaudiosrc", Properties::new())
    }

    pub fn send_video(peer: IpAddr, profile: &WireProfile) -> Self {
        Self::new("send-video", MediaKind::Video)
            .element(
                "theoraenc",
                Properties::new()
                    .with("bitrate", profile.video_bitrate)
                    .with("speed-level", profile.video_speed_level),
            )
            .element("rtptheorapay", Properties::new())
            .element("udpsink", udp_sink(peer, profile.video_port))
    }

    pub fn send_audio(peer: IpAddr, profile: &WireProfile) -> Self {
        Self::new("send-audio", MediaKind::Audio)
            .element("speexenc", Properties::new())
            .element("rtpspeexpay", Properties::new())
            .element("udpsink", udp_sink(peer, profile.audio_port))
    }

    pub fn receive_video(profile: &WireProfile) -> Self {
        Self::new("receive-video", MediaKind::Video)
            .element("udpsrc", udp_source(profile, MediaKind::Video))
            .element("rtptheoradepay", Properties::new())
            .element("theoradec", Properties::new())
            .element("videoconvert", Properties::new())
            .element("autovideosink", Properties::new())
    }

    pub fn receive_audio(profile: &WireProfile) -> Self {
        Self::new("receive-audio", MediaKind::Audio)
            .element("udpsrc", udp_source(profile, MediaKind::Audio))
            .element("rtpspeexdepay", Properties::new())
            .element("speexdec", Properties::new())
            .element("autoaudiosink", Properties::new())
    }

    /// Local render leaf hanging off the capture branch point. The queue puts
    /// the preview in its own streaming thread.
    pub fn preview() -> Self {
        Self::new("preview", MediaKind::Video)
            .element("queue", Properties::new())
            .element("videoconvert", Properties::new())
            .element("ximagesink", Properties::new())
    }
}

fn udp_sink(peer: IpAddr, port: u16) -> Properties {
    Properties::new()
        .with("host", peer.to_string())
        .with("port", port)
}

fn udp_source(profile: &WireProfile, kind: MediaKind) -> Properties {
    Properties::new()
        .with("port", profile.port(kind))
        .with_caps("caps", profile.rtp_caps(kind))
}

/// A built bin: its nodes in link order plus the logical entry and exit.
/// `entry` is `None` for bins that start with a source, `exit` is `None` for
/// bins that end with a sink.
#[derive(Clone, Debug)]
pub struct MediaBin {
    pub name: String,
    pub kind: MediaKind,
    pub nodes: Vec<NodeRef>,
    pub entry: Option<NodeRef>,
    pub exit: Option<NodeRef>,
}

impl MediaBin {
    /// Adds and links every element of `recipe`. Nothing is started. On any
    /// failure every node added by this call is removed again.
    pub fn build(graph: &mut ElementGraph, recipe: &BinRecipe) -> GraphResult<Self> {
        if recipe.elements.is_empty() {
            return Err(GraphError::EmptyBin(recipe.name.clone()));
        }

        let checkpoint = graph.checkpoint();
        match Self::build_linked(graph, recipe) {
            Ok(bin) => {
                log::debug!(
                    "graph {}: built bin {} ({} nodes)",
                    graph.name(),
                    bin.name,
                    bin.nodes.len()
                );
                Ok(bin)
            }
            Err(e) => {
                log::warn!(
                    "graph {}: bin {} failed, rolling back: {}",
                    graph.name(),
                    recipe.name,
                    e
                );
                graph.rollback(checkpoint);
                Err(e)
            }
        }
    }

    fn build_linked(graph: &mut ElementGraph, recipe: &BinRecipe) -> GraphResult<Self> {
        let mut nodes = Vec::with_capacity(recipe.elements.len());
        for decl in &recipe.elements {
            let node = graph.add_node(decl.factory, decl.properties.clone())?;
            if let Some(prev) = nodes.last() {
                graph.link(*prev, node)?;
            }
            nodes.push(node);
        }

        let role = |node: Option<&NodeRef>| node.and_then(|n| graph.node(*n)).map(|n| n.role());
        let entry = match role(nodes.first()) {
            Some(ElementRole::Source) => None,
            _ => nodes.first().copied(),
        };
        let exit = match role(nodes.last()) {
            Some(ElementRole::Sink) => None,
            _ => nodes.last().copied(),
        };

        Ok(Self {
            name: recipe.name.clone(),
            kind: recipe.kind,
            nodes,
            entry,
            exit,
        })
    }

    /// Links this bin's exit to `next`'s entry.
    pub fn link_to(&self, graph: &mut ElementGraph, next: &MediaBin) -> GraphResult<()> {
        match (self.exit, next.entry) {
            (Some(exit), Some(entry)) => graph.link(exit, entry),
            _ => Err(GraphError::IncompatibleLink {
                src: self.name.clone(),
                sink: next.name.clone(),
                reason: "bin has no free pad".to_string(),
            }),
        }
    }

    /// Render sinks of this bin that draw video into a window.
    pub fn render_sinks(&self, graph: &ElementGraph) -> Vec<NodeRef> {
        self.nodes
            .iter()
            .copied()
            .filter(|n| graph.node(*n).is_some_and(|n| n.schema.renders_video))
            .collect()
    }

    /// Every non-entry node is fed and every non-exit node feeds something,
    /// sources and sinks excepted.
    pub fn is_well_formed(&self, graph: &ElementGraph) -> bool {
        self.nodes.iter().all(|node| {
            let Some(n) = graph.node(*node) else {
                return false;
            };
            let fed = Some(*node) == self.entry
                || n.role() == ElementRole::Source
                || graph.upstream(*node).any(|u| self.nodes.contains(&u));
            let feeds = Some(*node) == self.exit
                || n.role() == ElementRole::Sink
                || graph.downstream(*node).any(|d| self.nodes.contains(&d));
            fed && feeds
        })
    }
}

#[cfg(test)]
#[path = "bins_test.rs"]
mod bins_test;
