//! In-process backend: no media flows, but every element, link, property and
//! state is tracked, pad formats are checked, and bus traffic is produced the
//! way a real framework would produce it. Faults can be injected from outside.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    backend::{Backend, BusMessage, BusSender, PipelineBackend, RenderTarget, StateScope},
    element::{NodeId, PipelineId, Properties, State, StateChange, schema},
    error::{GraphError, GraphResult},
};

/// Snapshot of one simulated element.
#[derive(Clone, Debug)]
pub struct SimElement {
    pub node: NodeId,
    pub factory: String,
    pub properties: Properties,
    pub state: State,
    pub render_target: Option<RenderTarget>,
}

struct SimPipelineState {
    name: String,
    bus: BusSender,
    state: State,
    elements: BTreeMap<NodeId, SimElement>,
    links: Vec<(NodeId, NodeId)>,
    /// Handles remembered across NULL, reapplied without asking again.
    known_targets: HashMap<NodeId, RenderTarget>,
}

impl SimPipelineState {
    fn apply_state(&mut self, nodes: &[NodeId], target: State) {
        for node in nodes {
            let Some(element) = self.elements.get_mut(node) else {
                continue;
            };
            let old = element.state;
            element.state = target;
            if target == State::Null {
                element.render_target = None;
            }
            let renders = schema(&element.factory).is_ok_and(|s| s.renders_video);
            if renders && target == State::Playing && element.render_target.is_none() {
                match self.known_targets.get(node) {
                    Some(known) => element.render_target = Some(*known),
                    None => self
                        .bus
                        .post(BusMessage::PrepareRenderTarget { node: *node }),
                }
            }
            if old != target {
                log::trace!(
                    "sim {}: {}#{} {} -> {}",
                    self.name,
                    element.factory,
                    node,
                    old,
                    target
                );
            }
        }
    }
}

#[derive(Default)]
struct SimState {
    pipelines: HashMap<PipelineId, SimPipelineState>,
    missing_factories: HashSet<String>,
    rejected_links: HashSet<(String, String)>,
    failing_states: HashSet<(String, State)>,
    pipelines_created: Vec<String>,
    elements_created: usize,
}

impl SimState {
    fn find(&self, name: &str) -> Option<&SimPipelineState> {
        self.pipelines.values().find(|p| p.name == name)
    }

    fn failing_factory<'a>(
        &self,
        mut factories: impl Iterator<Item = &'a str>,
        target: State,
    ) -> Option<String> {
        factories
            .find(|f| self.failing_states.contains(&(f.to_string(), target)))
            .map(str::to_string)
    }
}

#[derive(Clone, Default)]
pub struct SimBackend {
    shared: Arc<Mutex<SimState>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `factory` impossible to instantiate, as if its plugin were missing.
    pub fn missing_factory(&self, factory: &str) {
        self.state().missing_factories.insert(factory.to_string());
    }

    /// Makes every link from `src` elements to `sink` elements fail.
    pub fn reject_link(&self, src: &str, sink: &str) {
        self.state()
            .rejected_links
            .insert((src.to_string(), sink.to_string()));
    }

    /// Makes any state request to `target` fail when it touches `factory`.
    pub fn fail_state(&self, factory: &str, target: State) {
        self.state()
            .failing_states
            .insert((factory.to_string(), target));
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.missing_factories.clear();
        state.rejected_links.clear();
        state.failing_states.clear();
    }

    /// How many pipelines named `name` were ever created.
    pub fn pipelines_created(&self, name: &str) -> usize {
        self.state()
            .pipelines_created
            .iter()
            .filter(|n| *n == name)
            .count()
    }

    pub fn elements_created(&self) -> usize {
        self.state().elements_created
    }

    pub fn live_pipelines(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .state()
            .pipelines
            .values()
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn pipeline_state(&self, name: &str) -> Option<State> {
        self.state().find(name).map(|p| p.state)
    }

    pub fn element_count(&self, name: &str) -> usize {
        self.state().find(name).map_or(0, |p| p.elements.len())
    }

    pub fn link_count(&self, name: &str) -> usize {
        self.state().find(name).map_or(0, |p| p.links.len())
    }

    pub fn elements(&self, name: &str, factory: &str) -> Vec<SimElement> {
        self.state()
            .find(name)
            .map(|p| {
                p.elements
                    .values()
                    .filter(|e| e.factory == factory)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First element of type `factory` in pipeline `name`.
    pub fn element(&self, name: &str, factory: &str) -> Option<SimElement> {
        self.elements(name, factory).into_iter().next()
    }

    fn post_from(&self, name: &str, factory: Option<&str>, make: impl Fn(Option<NodeId>) -> BusMessage) -> bool {
        let state = self.state();
        let Some(pipeline) = state.find(name) else {
            return false;
        };
        let node = match factory {
            Some(factory) => match pipeline.elements.values().find(|e| e.factory == factory) {
                Some(e) => Some(e.node),
                None => return false,
            },
            None => None,
        };
        pipeline.bus.post(make(node));
        true
    }

    /// Posts a runtime error from the first `factory` element of pipeline `name`.
    pub fn post_error(&self, name: &str, factory: &str, reason: &str) -> bool {
        self.post_from(name, Some(factory), |node| BusMessage::Error {
            node,
            reason: reason.to_string(),
        })
    }

    /// Posts a pipeline-level error with no source element.
    pub fn post_pipeline_error(&self, name: &str, reason: &str) -> bool {
        self.post_from(name, None, |node| BusMessage::Error {
            node,
            reason: reason.to_string(),
        })
    }

    pub fn post_eos(&self, name: &str, factory: Option<&str>) -> bool {
        self.post_from(name, factory, |node| BusMessage::EndOfStream { node })
    }

    pub fn post_render_request(&self, name: &str, factory: &str) -> bool {
        let state = self.state();
        let Some(pipeline) = state.find(name) else {
            return false;
        };
        match pipeline.elements.values().find(|e| e.factory == factory) {
            Some(e) => {
                pipeline
                    .bus
                    .post(BusMessage::PrepareRenderTarget { node: e.node });
                true
            }
            None => false,
        }
    }
}

impl Backend for SimBackend {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn create_pipeline(&self, name: &str, bus: BusSender) -> GraphResult<Box<dyn PipelineBackend>> {
        let id = bus.pipeline();
        let mut state = self.state();
        state.pipelines_created.push(name.to_string());
        state.pipelines.insert(
            id,
            SimPipelineState {
                name: name.to_string(),
                bus,
                state: State::Null,
                elements: BTreeMap::new(),
                links: Vec::new(),
                known_targets: HashMap::new(),
            },
        );
        log::debug!("sim: created pipeline {} ({})", name, id);
        Ok(Box::new(SimPipeline {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct SimPipeline {
    id: PipelineId,
    shared: Arc<Mutex<SimState>>,
}

impl SimPipeline {
    fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> GraphResult<T>) -> GraphResult<T> {
        let mut state = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

impl PipelineBackend for SimPipeline {
    fn add_element(
        &mut self,
        node: NodeId,
        factory: &str,
        properties: &Properties,
    ) -> GraphResult<()> {
        let id = self.id;
        self.with_state(|state| {
            if state.missing_factories.contains(factory) {
                return Err(GraphError::UnknownElementType(factory.to_string()));
            }
            schema(factory)?;
            let pipeline = state
                .pipelines
                .get_mut(&id)
                .ok_or_else(|| GraphError::Backend(format!("pipeline {} is gone", id)))?;
            pipeline.elements.insert(
                node,
                SimElement {
                    node,
                    factory: factory.to_string(),
                    properties: properties.clone(),
                    state: pipeline.state,
                    render_target: None,
                },
            );
            state.elements_created += 1;
            Ok(())
        })
    }

    fn remove_element(&mut self, node: NodeId) {
        let id = self.id;
        let _ = self.with_state(|state| {
            if let Some(pipeline) = state.pipelines.get_mut(&id) {
                pipeline.elements.remove(&node);
                pipeline.known_targets.remove(&node);
                pipeline.links.retain(|(a, b)| *a != node && *b != node);
            }
            Ok(())
        });
    }

    fn link(&mut self, src: NodeId, sink: NodeId) -> GraphResult<()> {
        let id = self.id;
        self.with_state(|state| {
            let pipeline = state
                .pipelines
                .get(&id)
                .ok_or_else(|| GraphError::Backend(format!("pipeline {} is gone", id)))?;
            let lookup = |node: NodeId| {
                pipeline
                    .elements
                    .get(&node)
                    .map(|e| e.factory.clone())
                    .ok_or_else(|| GraphError::Backend(format!("no element {} in {}", node, id)))
            };
            let src_factory = lookup(src)?;
            let sink_factory = lookup(sink)?;

            if state
                .rejected_links
                .contains(&(src_factory.clone(), sink_factory.clone()))
            {
                return Err(GraphError::IncompatibleLink {
                    src: src_factory,
                    sink: sink_factory,
                    reason: "rejected by framework".to_string(),
                });
            }

            let out = schema(&src_factory)?.src_pad;
            let input = schema(&sink_factory)?.sink_pad;
            match (out, input) {
                (Some(out), Some(input)) if out.accepts(input) => {}
                (out, input) => {
                    return Err(GraphError::IncompatibleLink {
                        src: src_factory,
                        sink: sink_factory,
                        reason: format!("format mismatch: {:?} -> {:?}", out, input),
                    });
                }
            }

            if let Some(pipeline) = state.pipelines.get_mut(&id) {
                pipeline.links.push((src, sink));
            }
            Ok(())
        })
    }

    fn unlink(&mut self, src: NodeId, sink: NodeId) {
        let id = self.id;
        let _ = self.with_state(|state| {
            if let Some(pipeline) = state.pipelines.get_mut(&id) {
                pipeline.links.retain(|l| *l != (src, sink));
            }
            Ok(())
        });
    }

    fn set_state(&mut self, scope: StateScope<'_>, target: State) -> GraphResult<StateChange> {
        let id = self.id;
        self.with_state(|state| {
            let pipeline = state
                .pipelines
                .get(&id)
                .ok_or_else(|| GraphError::Backend(format!("pipeline {} is gone", id)))?;
            let nodes: Vec<NodeId> = match scope {
                StateScope::Pipeline => pipeline.elements.keys().copied().collect(),
                StateScope::Nodes(nodes) => nodes.to_vec(),
            };
            let factories = nodes
                .iter()
                .filter_map(|n| pipeline.elements.get(n))
                .map(|e| e.factory.as_str());
            if let Some(factory) = state.failing_factory(factories, target) {
                return Err(GraphError::AsyncStateChangeFailed {
                    target,
                    reason: format!("{} refused to change state", factory),
                });
            }

            let Some(pipeline) = state.pipelines.get_mut(&id) else {
                return Err(GraphError::Backend(format!("pipeline {} is gone", id)));
            };
            let old = match scope {
                StateScope::Pipeline => pipeline.state,
                StateScope::Nodes(nodes) => nodes
                    .first()
                    .and_then(|n| pipeline.elements.get(n))
                    .map_or(pipeline.state, |e| e.state),
            };
            pipeline.apply_state(&nodes, target);
            match scope {
                StateScope::Pipeline => {
                    pipeline.state = target;
                    pipeline.bus.post(BusMessage::StateChanged {
                        node: None,
                        old,
                        new: target,
                    });
                }
                StateScope::Nodes(nodes) => {
                    for node in nodes {
                        pipeline.bus.post(BusMessage::StateChanged {
                            node: Some(*node),
                            old,
                            new: target,
                        });
                    }
                }
            }

            if target > old && target >= State::Paused {
                Ok(StateChange::Async)
            } else {
                Ok(StateChange::Success)
            }
        })
    }

    fn set_render_target(&mut self, node: NodeId, target: RenderTarget) -> GraphResult<()> {
        let id = self.id;
        self.with_state(|state| {
            let pipeline = state
                .pipelines
                .get_mut(&id)
                .ok_or_else(|| GraphError::Backend(format!("pipeline {} is gone", id)))?;
            let element = pipeline
                .elements
                .get_mut(&node)
                .ok_or_else(|| GraphError::Backend(format!("no element {} in {}", node, id)))?;
            element.render_target = Some(target);
            pipeline.known_targets.insert(node, target);
            Ok(())
        })
    }

    fn clear_render_targets(&mut self) {
        let id = self.id;
        let _ = self.with_state(|state| {
            if let Some(pipeline) = state.pipelines.get_mut(&id) {
                pipeline.known_targets.clear();
                for element in pipeline.elements.values_mut() {
                    element.render_target = None;
                }
            }
            Ok(())
        });
    }
}

impl Drop for SimPipeline {
    fn drop(&mut self) {
        let mut state = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pipeline) = state.pipelines.remove(&self.id) {
            log::debug!("sim: released pipeline {} ({})", pipeline.name, self.id);
        }
    }
}
