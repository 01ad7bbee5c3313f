//! GStreamer backend. Elements are named `<factory>-n<id>` so bus messages can
//! be traced back to graph nodes.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_video::prelude::*;

use crate::{
    backend::{Backend, BusMessage, BusSender, PipelineBackend, RenderTarget, StateScope},
    element::{NodeId, Properties, PropertyValue, State, StateChange},
    error::{GraphError, GraphResult},
};

type Targets = Arc<Mutex<HashMap<NodeId, RenderTarget>>>;

/// Requires [`crate::init`] to have run.
#[derive(Clone, Copy, Debug, Default)]
pub struct GstBackend;

impl GstBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for GstBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn create_pipeline(&self, name: &str, bus: BusSender) -> GraphResult<Box<dyn PipelineBackend>> {
        let pipeline = gst::Pipeline::with_name(&format!("{}-{}", name, bus.pipeline()));
        let gst_bus = pipeline
            .bus()
            .ok_or_else(|| GraphError::Backend(format!("pipeline {} has no bus", name)))?;

        let targets: Targets = Arc::default();
        let handler_targets = Arc::clone(&targets);
        gst_bus.set_sync_handler(move |_, msg| {
            on_message(&bus, &handler_targets, msg);
            gst::BusSyncReply::Drop
        });

        Ok(Box::new(GstPipeline {
            pipeline,
            elements: HashMap::new(),
            targets,
        }))
    }
}

struct GstPipeline {
    pipeline: gst::Pipeline,
    elements: HashMap<NodeId, gst::Element>,
    targets: Targets,
}

impl GstPipeline {
    fn element(&self, node: NodeId) -> GraphResult<&gst::Element> {
        self.elements
            .get(&node)
            .ok_or_else(|| GraphError::Backend(format!("no element n{}", node)))
    }
}

fn element_name(factory: &str, node: NodeId) -> String {
    format!("{}-n{}", factory, node)
}

fn parse_node(name: &str) -> Option<NodeId> {
    let (_, id) = name.rsplit_once("-n")?;
    id.parse().ok().map(NodeId)
}

/// Walks up from the posting object to the element that was added to the
/// pipeline. `None` for the pipeline itself.
fn node_of(src: Option<&gst::Object>) -> Option<NodeId> {
    let mut current = src.cloned();
    while let Some(object) = current {
        let parent = object.parent();
        let top_level = parent.as_ref().is_some_and(|p| p.is::<gst::Pipeline>());
        if top_level {
            return parse_node(&object.name());
        }
        current = parent;
    }
    None
}

fn from_gst_state(state: gst::State) -> Option<State> {
    match state {
        gst::State::Null => Some(State::Null),
        gst::State::Ready => Some(State::Ready),
        gst::State::Paused => Some(State::Paused),
        gst::State::Playing => Some(State::Playing),
        _ => None,
    }
}

fn to_gst_state(state: State) -> gst::State {
    match state {
        State::Null => gst::State::Null,
        State::Ready => gst::State::Ready,
        State::Paused => gst::State::Paused,
        State::Playing => gst::State::Playing,
    }
}

fn on_message(bus: &BusSender, targets: &Targets, msg: &gst::Message) {
    use gst::MessageView;

    let src = msg.src();
    let is_pipeline = src.is_some_and(|s| s.is::<gst::Pipeline>());
    let node = node_of(src);

    if gstreamer_video::is_video_overlay_prepare_window_handle_message(msg) {
        let Some(node) = node else {
            return;
        };
        let known = targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node)
            .copied();
        match (known, src.and_then(|s| s.dynamic_cast_ref::<gstreamer_video::VideoOverlay>())) {
            (Some(target), Some(overlay)) => unsafe { overlay.set_window_handle(target.0) },
            _ => bus.post(BusMessage::PrepareRenderTarget { node }),
        }
        return;
    }

    match msg.view() {
        MessageView::StateChanged(s) => {
            let (Some(old), Some(new)) = (from_gst_state(s.old()), from_gst_state(s.current()))
            else {
                return;
            };
            if is_pipeline {
                bus.post(BusMessage::StateChanged { node: None, old, new });
            } else if node.is_some() {
                bus.post(BusMessage::StateChanged { node, old, new });
            }
        }
        MessageView::Error(e) => {
            let reason = match e.debug() {
                Some(debug) => format!("{} ({})", e.error(), debug),
                None => e.error().to_string(),
            };
            bus.post(BusMessage::Error { node, reason });
        }
        MessageView::Warning(w) => {
            bus.post(BusMessage::Warning {
                node,
                reason: w.error().to_string(),
            });
        }
        MessageView::Eos(_) => bus.post(BusMessage::EndOfStream { node }),
        _ => {}
    }
}

fn apply_property(element: &gst::Element, key: &str, value: &PropertyValue) -> GraphResult<()> {
    if element.find_property(key).is_none() {
        return Err(GraphError::UnknownProperty {
            element: element.name().to_string(),
            property: key.to_string(),
        });
    }
    match value {
        PropertyValue::Str(s) => element.set_property_from_str(key, s),
        PropertyValue::Int(i) => element.set_property_from_str(key, &i.to_string()),
        PropertyValue::Bool(b) => element.set_property_from_str(key, if *b { "true" } else { "false" }),
        PropertyValue::Caps(caps) => {
            let caps = caps.parse::<gst::Caps>().map_err(|e| {
                GraphError::Backend(format!("invalid caps `{}`: {}", caps, e))
            })?;
            element.set_property(key, caps);
        }
    }
    Ok(())
}

impl PipelineBackend for GstPipeline {
    fn add_element(
        &mut self,
        node: NodeId,
        factory: &str,
        properties: &Properties,
    ) -> GraphResult<()> {
        let element = gst::ElementFactory::make(factory)
            .name(element_name(factory, node))
            .build()
            .map_err(|_| GraphError::UnknownElementType(factory.to_string()))?;
        for (key, value) in properties.iter() {
            apply_property(&element, key, value)?;
        }
        self.pipeline
            .add(&element)
            .map_err(|e| GraphError::Backend(e.to_string()))?;
        self.elements.insert(node, element);
        Ok(())
    }

    fn remove_element(&mut self, node: NodeId) {
        if let Some(element) = self.elements.remove(&node) {
            let _ = element.set_state(gst::State::Null);
            if let Err(e) = self.pipeline.remove(&element) {
                log::warn!("gst: removing {} failed: {}", element.name(), e);
            }
        }
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node);
    }

    fn link(&mut self, src: NodeId, sink: NodeId) -> GraphResult<()> {
        let (a, b) = (self.element(src)?, self.element(sink)?);
        a.link(b).map_err(|e| GraphError::IncompatibleLink {
            src: a.name().to_string(),
            sink: b.name().to_string(),
            reason: e.to_string(),
        })
    }

    fn unlink(&mut self, src: NodeId, sink: NodeId) {
        if let (Ok(a), Ok(b)) = (self.element(src), self.element(sink)) {
            a.unlink(b);
        }
    }

    fn set_state(&mut self, scope: StateScope<'_>, state: State) -> GraphResult<StateChange> {
        let failed = |e: gst::StateChangeError| GraphError::AsyncStateChangeFailed {
            target: state,
            reason: e.to_string(),
        };
        let target = to_gst_state(state);
        let change = match scope {
            StateScope::Pipeline => self.pipeline.set_state(target).map_err(failed)?,
            StateScope::Nodes(nodes) => {
                let mut change = gst::StateChangeSuccess::Success;
                for node in nodes {
                    let element = self.element(*node)?;
                    let result = element.set_state(target).map_err(failed)?;
                    if result != gst::StateChangeSuccess::Success {
                        change = result;
                    }
                }
                change
            }
        };
        Ok(match change {
            gst::StateChangeSuccess::Async => StateChange::Async,
            gst::StateChangeSuccess::NoPreroll => StateChange::NoPreroll,
            _ => StateChange::Success,
        })
    }

    fn set_render_target(&mut self, node: NodeId, target: RenderTarget) -> GraphResult<()> {
        let element = self.element(node)?.clone();
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, target);
        // bins like autovideosink pick the handle up on their next prepare request
        if let Some(overlay) = element.dynamic_cast_ref::<gstreamer_video::VideoOverlay>() {
            unsafe { overlay.set_window_handle(target.0) };
        }
        Ok(())
    }

    fn clear_render_targets(&mut self) {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for GstPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            log::warn!("gst: {} refused NULL on release: {}", self.pipeline.name(), e);
        }
        if let Some(bus) = self.pipeline.bus() {
            bus.unset_sync_handler();
        }
    }
}
