use std::{
    fmt::{Display, Formatter},
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one top-level graph. Bus messages carry it so late notifications
/// can be matched against the graph that is currently alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(u64);

impl PipelineId {
    pub fn next() -> Self {
        Self(NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for PipelineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a node, scoped to the graph that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub pipeline: PipelineId,
    pub id: NodeId,
}

impl Display for NodeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/n{}", self.pipeline, self.id)
    }
}

/// Framework lifecycle states, in increasing order of activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Null,
    Ready,
    Paused,
    Playing,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Null => "NULL",
            State::Ready => "READY",
            State::Paused => "PAUSED",
            State::Playing => "PLAYING",
        };
        f.write_str(s)
    }
}

/// Successful outcome of a state request. Failure is reported as
/// [`GraphError::AsyncStateChangeFailed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateChange {
    Success,
    Async,
    NoPreroll,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    Str,
    Int,
    Bool,
    Caps,
}

impl Display for PropertyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PropertyKind::Str => "string",
            PropertyKind::Int => "int",
            PropertyKind::Bool => "bool",
            PropertyKind::Caps => "caps",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Caps in their serialized form, e.g. `video/x-raw,width=320`.
    Caps(String),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Str(_) => PropertyKind::Str,
            PropertyValue::Int(_) => PropertyKind::Int,
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Caps(_) => PropertyKind::Caps,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) | PropertyValue::Caps(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Str(s) | PropertyValue::Caps(s) => f.write_str(s),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value as i64)
    }
}

impl From<u16> for PropertyValue {
    fn from(value: u16) -> Self {
        PropertyValue::Int(value as i64)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Int(value as i64)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// Ordered property bag. Order is kept so backends apply properties the way
/// the recipe lists them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties(Vec<(String, PropertyValue)>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn with_caps(self, key: &str, caps: impl Into<String>) -> Self {
        self.with(key, PropertyValue::Caps(caps.into()))
    }

    pub fn set(&mut self, key: &str, value: impl Into<PropertyValue>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What kind of data flows through a pad.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PadFormat {
    Any,
    RawVideo,
    RawAudio,
    Theora,
    Speex,
    Rtp,
}

impl PadFormat {
    pub fn accepts(self, other: PadFormat) -> bool {
        self == PadFormat::Any || other == PadFormat::Any || self == other
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementRole {
    Source,
    Filter,
    /// Branch point: the only role allowed to feed more than one consumer.
    Tee,
    Sink,
}

/// Static description of an element type: role, pad formats, property schema.
#[derive(Debug)]
pub struct ElementSchema {
    pub factory: &'static str,
    pub role: ElementRole,
    pub sink_pad: Option<PadFormat>,
    pub src_pad: Option<PadFormat>,
    pub properties: &'static [(&'static str, PropertyKind)],
    /// Sinks that draw into a window and therefore ask for a render target.
    pub renders_video: bool,
}

impl ElementSchema {
    const fn source(factory: &'static str, out: PadFormat) -> Self {
        Self {
            factory,
            role: ElementRole::Source,
            sink_pad: None,
            src_pad: Some(out),
            properties: &[],
            renders_video: false,
        }
    }

    const fn filter(factory: &'static str, input: PadFormat, out: PadFormat) -> Self {
        Self {
            factory,
            role: ElementRole::Filter,
            sink_pad: Some(input),
            src_pad: Some(out),
            properties: &[],
            renders_video: false,
        }
    }

    const fn sink(factory: &'static str, input: PadFormat) -> Self {
        Self {
            factory,
            role: ElementRole::Sink,
            sink_pad: Some(input),
            src_pad: None,
            properties: &[],
            renders_video: false,
        }
    }

    const fn props(mut self, properties: &'static [(&'static str, PropertyKind)]) -> Self {
        self.properties = properties;
        self
    }

    const fn rendering(mut self) -> Self {
        self.renders_video = true;
        self
    }

    pub fn property_kind(&self, name: &str) -> Option<PropertyKind> {
        self.properties
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, k)| *k)
    }

    /// Checks every property against the schema.
    pub fn validate(&self, properties: &Properties) -> GraphResult<()> {
        for (name, value) in properties.iter() {
            let expected = self
                .property_kind(name)
                .ok_or_else(|| GraphError::UnknownProperty {
                    element: self.factory.to_string(),
                    property: name.to_string(),
                })?;
            if expected != value.kind() {
                return Err(GraphError::PropertyType {
                    element: self.factory.to_string(),
                    property: name.to_string(),
                    expected,
                    actual: value.kind(),
                });
            }
        }
        Ok(())
    }
}

use PadFormat::*;
use PropertyKind::{Bool as B, Caps as C, Int as I, Str as S};

static CATALOG: &[ElementSchema] = &[
    // capture
    ElementSchema::source("autovideosrc", RawVideo),
    ElementSchema::source("videotestsrc", RawVideo).props(&[("pattern", I), ("is-live", B)]),
    ElementSchema::filter("videorate", RawVideo, RawVideo).props(&[("max-rate", I), ("drop-only", B)]),
    ElementSchema::filter("capsfilter", Any, Any).props(&[("caps", C)]),
    ElementSchema::source("autoaudiosrc", RawAudio),
    ElementSchema::source("audiotestsrc", RawAudio).props(&[("wave", I), ("is-live", B)]),
    // branching and decoupling
    ElementSchema {
        factory: "tee",
        role: ElementRole::Tee,
        sink_pad: Some(Any),
        src_pad: Some(Any),
        properties: &[("allow-not-linked", B)],
        renders_video: false,
    },
    ElementSchema::filter("queue", Any, Any).props(&[("max-size-buffers", I), ("leaky", I)]),
    ElementSchema::filter("videoconvert", RawVideo, RawVideo),
    // encode / payload
    ElementSchema::filter("theoraenc", RawVideo, Theora).props(&[("bitrate", I), ("speed-level", I)]),
    ElementSchema::filter("rtptheorapay", Theora, Rtp).props(&[("config-interval", I)]),
    ElementSchema::filter("speexenc", RawAudio, Speex).props(&[("quality", I), ("bitrate", I)]),
    ElementSchema::filter("rtpspeexpay", Speex, Rtp),
    // transport
    ElementSchema::sink("udpsink", Rtp).props(&[("host", S), ("port", I), ("sync", B), ("async", B)]),
    ElementSchema::source("udpsrc", Rtp).props(&[("port", I), ("caps", C)]),
    // depayload / decode
    ElementSchema::filter("rtptheoradepay", Rtp, Theora),
    ElementSchema::filter("theoradec", Theora, RawVideo),
    ElementSchema::filter("rtpspeexdepay", Rtp, Speex),
    ElementSchema::filter("speexdec", Speex, RawAudio),
    // render
    ElementSchema::sink("ximagesink", RawVideo).props(&[("sync", B)]).rendering(),
    ElementSchema::sink("autovideosink", RawVideo).props(&[("sync", B)]).rendering(),
    ElementSchema::sink("autoaudiosink", RawAudio).props(&[("sync", B)]),
    ElementSchema::sink("fakesink", Any).props(&[("sync", B)]),
];

/// Looks up an element type in the catalog.
pub fn schema(factory: &str) -> GraphResult<&'static ElementSchema> {
    CATALOG
        .iter()
        .find(|s| s.factory == factory)
        .ok_or_else(|| GraphError::UnknownElementType(factory.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lookup() {
        assert_eq!(schema("theoraenc").unwrap().role, ElementRole::Filter);
        assert_eq!(schema("tee").unwrap().role, ElementRole::Tee);
        assert_eq!(
            schema("x264enc").unwrap_err(),
            GraphError::UnknownElementType("x264enc".to_string())
        );
    }

    #[test]
    fn test_validate_rejects_unknown_key() {
        let props = Properties::new().with("bitrate", 50).with("preset", "fast");
        let err = schema("theoraenc").unwrap().validate(&props).unwrap_err();
        assert!(matches!(err, GraphError::UnknownProperty { ref property, .. } if property == "preset"));
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let props = Properties::new().with("port", "5004");
        let err = schema("udpsink").unwrap().validate(&props).unwrap_err();
        assert_eq!(
            err,
            GraphError::PropertyType {
                element: "udpsink".to_string(),
                property: "port".to_string(),
                expected: PropertyKind::Int,
                actual: PropertyKind::Str,
            }
        );
    }

    #[test]
    fn test_properties_set_replaces() {
        let mut props = Properties::new().with("host", "10.0.0.5");
        props.set("host", "10.0.0.9");
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("host").and_then(|v| v.as_str()), Some("10.0.0.9"));
    }

    #[test]
    fn test_pad_format_accepts() {
        assert!(PadFormat::Any.accepts(PadFormat::Rtp));
        assert!(PadFormat::RawVideo.accepts(PadFormat::RawVideo));
        assert!(!PadFormat::Theora.accepts(PadFormat::Speex));
    }
}
