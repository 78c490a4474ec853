//! The workflow graph: nodes, input bindings, and the dependency DAG.

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::path::PathBuf;
use std::sync::Arc;

use flow_core::{
    ConstructionError, EventBus, ExecutionEvent, FlowError, NodeId, Processor, ProcessorKind,
    ResourceFailure, ResourcePhase, Signature, Value,
};

use crate::batch::{BatchReport, BatchRunner};
use crate::executor::Executor;
use crate::store::ValueStore;

/// How a processor input parameter is supplied.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A fixed value, passed through as-is.
    Literal(Value),
    /// The output of another node, resolved at execution time.
    Node(NodeId),
}

impl Binding {
    pub fn value(value: impl Into<Value>) -> Self {
        Binding::Literal(value.into())
    }

    pub fn node(id: NodeId) -> Self {
        Binding::Node(id)
    }
}

pub(crate) struct ConstantSlot {
    pub(crate) name: String,
    pub(crate) value: Value,
}

pub(crate) struct ProcessorSlot {
    pub(crate) kind: Arc<dyn ProcessorKind>,
    pub(crate) config: BTreeMap<String, Value>,
    pub(crate) bindings: BTreeMap<String, Binding>,
    /// Lazily created instance; present only between the first cache miss
    /// and the next release.
    pub(crate) instance: Option<Box<dyn Processor>>,
    /// Resolved inputs are type-checked once, on the first execution that
    /// touches the node.
    pub(crate) inputs_validated: bool,
}

pub(crate) enum NodeSlot {
    Constant(ConstantSlot),
    Processor(ProcessorSlot),
}

impl NodeSlot {
    pub(crate) fn name(&self) -> &str {
        match self {
            NodeSlot::Constant(c) => &c.name,
            NodeSlot::Processor(p) => p.kind.name(),
        }
    }
}

/// A directed acyclic graph of processing nodes plus the value store its
/// outputs persist to.
///
/// The graph is driven serially: one `run_upto` at a time, one `process`
/// call at a time. Higher-level parallelism belongs in separate processes
/// over distinct persistence locations.
pub struct Graph {
    nodes: BTreeMap<NodeId, NodeSlot>,
    dag: StableDiGraph<NodeId, ()>,
    indices: HashMap<NodeId, NodeIndex>,
    store: ValueStore,
    events: EventBus,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            dag: StableDiGraph::new(),
            indices: HashMap::new(),
            store: ValueStore::new(),
            events: EventBus::default(),
        }
    }

    /// Add a node holding a directly-set value. Its output is the value
    /// itself; changing the value changes its fingerprint, which invalidates
    /// every descendant's cached output at the next run.
    pub fn add_constant_node(
        &mut self,
        id: NodeId,
        name: impl Into<String>,
    ) -> Result<NodeId, ConstructionError> {
        if self.nodes.contains_key(&id) {
            return Err(ConstructionError::DuplicateNodeId(id));
        }
        self.nodes.insert(
            id,
            NodeSlot::Constant(ConstantSlot {
                name: name.into(),
                value: Value::Null,
            }),
        );
        let idx = self.dag.add_node(id);
        self.indices.insert(id, idx);
        Ok(id)
    }

    /// Set a constant node's value. The primary mechanism for driving
    /// different items through the same graph.
    pub fn set_constant(&mut self, id: NodeId, value: Value) -> Result<(), ConstructionError> {
        match self.nodes.get_mut(&id) {
            Some(NodeSlot::Constant(c)) => {
                c.value = value;
                Ok(())
            }
            Some(_) => Err(ConstructionError::NotAConstant(id)),
            None => Err(ConstructionError::UnknownNode(id)),
        }
    }

    pub fn constant_value(&self, id: NodeId) -> Result<&Value, ConstructionError> {
        match self.nodes.get(&id) {
            Some(NodeSlot::Constant(c)) => Ok(&c.value),
            Some(_) => Err(ConstructionError::NotAConstant(id)),
            None => Err(ConstructionError::UnknownNode(id)),
        }
    }

    /// Add a processor node with no construction arguments.
    pub fn add_node(
        &mut self,
        id: NodeId,
        kind: Arc<dyn ProcessorKind>,
        bindings: BTreeMap<String, Binding>,
    ) -> Result<NodeId, ConstructionError> {
        self.add_node_with_config(id, kind, bindings, BTreeMap::new())
    }

    /// Add a processor node. Bindings are validated against the kind's
    /// `process` signature and `config` against its construction schema,
    /// both immediately.
    pub fn add_node_with_config(
        &mut self,
        id: NodeId,
        kind: Arc<dyn ProcessorKind>,
        bindings: BTreeMap<String, Binding>,
        config: BTreeMap<String, Value>,
    ) -> Result<NodeId, ConstructionError> {
        if self.nodes.contains_key(&id) {
            return Err(ConstructionError::DuplicateNodeId(id));
        }

        let signature = kind.signature();
        for (param, binding) in &bindings {
            let declared = signature.get(param).ok_or_else(|| {
                ConstructionError::UnknownParameter {
                    node_id: id,
                    param: param.clone(),
                }
            })?;
            match binding {
                Binding::Literal(value) => {
                    if !declared.ty.matches(value) {
                        return Err(ConstructionError::TypeMismatch {
                            node_id: id,
                            param: param.clone(),
                            expected: declared.ty.to_string(),
                            actual: value.kind_name().to_string(),
                        });
                    }
                }
                Binding::Node(referent) => {
                    if *referent == id {
                        return Err(ConstructionError::Cycle(id));
                    }
                    if !self.nodes.contains_key(referent) {
                        return Err(ConstructionError::UnknownReferent {
                            node_id: id,
                            param: param.clone(),
                            referent: *referent,
                        });
                    }
                }
            }
        }
        for param in signature.params() {
            if !bindings.contains_key(&param.name) {
                return Err(ConstructionError::MissingParameter {
                    node_id: id,
                    param: param.name.clone(),
                });
            }
        }

        validate_values(id, &kind.config_schema(), &config)?;

        let idx = self.dag.add_node(id);
        self.indices.insert(id, idx);
        for binding in bindings.values() {
            if let Binding::Node(referent) = binding {
                let ref_idx = self.indices[referent];
                self.dag.add_edge(ref_idx, idx, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&self.dag) {
            self.dag.remove_node(idx);
            self.indices.remove(&id);
            return Err(ConstructionError::Cycle(id));
        }

        self.nodes.insert(
            id,
            NodeSlot::Processor(ProcessorSlot {
                kind,
                config,
                bindings,
                instance: None,
                inputs_validated: false,
            }),
        );
        Ok(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|slot| slot.name())
    }

    /// The targets and all of their ancestors in dependency order.
    /// Deterministic: ties are broken by ascending node id.
    pub fn topological_sort(&self, targets: &[NodeId]) -> Result<Vec<NodeId>, ConstructionError> {
        for target in targets {
            if !self.nodes.contains_key(target) {
                return Err(ConstructionError::UnknownNode(*target));
            }
        }

        // Ancestors of the targets, targets included.
        let mut subgraph: BTreeSet<NodeId> = BTreeSet::new();
        let mut stack: Vec<NodeId> = targets.to_vec();
        while let Some(id) = stack.pop() {
            if !subgraph.insert(id) {
                continue;
            }
            for dep_idx in self
                .dag
                .neighbors_directed(self.indices[&id], Direction::Incoming)
            {
                stack.push(self.dag[dep_idx]);
            }
        }

        // Kahn's algorithm over the subgraph with a min-heap on node id.
        let mut in_degree: BTreeMap<NodeId, usize> = BTreeMap::new();
        for &id in &subgraph {
            let deps = self
                .dag
                .neighbors_directed(self.indices[&id], Direction::Incoming)
                .filter(|dep_idx| subgraph.contains(&self.dag[*dep_idx]))
                .count();
            in_degree.insert(id, deps);
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();

        let mut order = Vec::with_capacity(subgraph.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for dependent_idx in self
                .dag
                .neighbors_directed(self.indices[&id], Direction::Outgoing)
            {
                let dependent = self.dag[dependent_idx];
                if let Some(deg) = in_degree.get_mut(&dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse(dependent));
                    }
                }
            }
        }

        if order.len() != subgraph.len() {
            let stuck = subgraph
                .iter()
                .find(|&&id| !order.contains(&id))
                .copied()
                .unwrap_or_default();
            return Err(ConstructionError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Execute the target and all of its ancestors, reusing cached outputs,
    /// and return the target's output.
    pub async fn run_upto(&mut self, target: NodeId) -> Result<Value, FlowError> {
        Executor::new().run_upto(self, target).await
    }

    /// Run a batch of items breadth-first with default options and release
    /// policy. See [`BatchRunner`] for customization.
    pub async fn process_batch<T, F>(
        &mut self,
        items: Vec<T>,
        targets: &[NodeId],
        prepare: F,
    ) -> Result<BatchReport<T>, FlowError>
    where
        T: Clone,
        F: FnMut(usize, &T, &mut Graph) -> Result<(), FlowError>,
    {
        BatchRunner::new().process_batch(self, items, targets, prepare).await
    }

    /// Call `release` on every initialized node and discard its instance.
    /// Cached outputs are untouched; the graph remains usable.
    pub async fn release_resources(&mut self) -> Result<(), FlowError> {
        let mut first_error: Option<FlowError> = None;
        for (&id, slot) in self.nodes.iter_mut() {
            let NodeSlot::Processor(p) = slot else { continue };
            let Some(mut instance) = p.instance.take() else { continue };
            tracing::info!(node_id = id, name = p.kind.name(), "releasing node resources");
            if let Err(err) = instance.release().await {
                let failure = ResourceFailure {
                    node_id: id,
                    name: p.kind.name().to_string(),
                    phase: ResourcePhase::Release,
                    source: err,
                };
                tracing::error!(node_id = id, error = %failure, "release failed");
                if first_error.is_none() {
                    first_error = Some(failure.into());
                }
            }
        }
        self.events.emit(ExecutionEvent::ResourcesReleased {
            timestamp: chrono::Utc::now(),
        });
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Bind the value store to a persistence location (one per batch item).
    pub fn persist(&mut self, location: impl Into<PathBuf>) {
        let location = location.into();
        tracing::info!(location = %location.display(), "binding persistence location");
        self.store.bind(location);
    }

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ValueStore {
        &mut self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn parts_mut(
        &mut self,
    ) -> (
        &mut BTreeMap<NodeId, NodeSlot>,
        &mut ValueStore,
        &EventBus,
    ) {
        (&mut self.nodes, &mut self.store, &self.events)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a value map against a declared signature: exact key cover plus
/// per-parameter type checks.
pub(crate) fn validate_values(
    node_id: NodeId,
    signature: &Signature,
    values: &BTreeMap<String, Value>,
) -> Result<(), ConstructionError> {
    for (name, value) in values {
        let declared = signature.get(name).ok_or_else(|| {
            ConstructionError::UnknownParameter {
                node_id,
                param: name.clone(),
            }
        })?;
        if !declared.ty.matches(value) {
            return Err(ConstructionError::TypeMismatch {
                node_id,
                param: name.clone(),
                expected: declared.ty.to_string(),
                actual: value.kind_name().to_string(),
            });
        }
    }
    for param in signature.params() {
        if !values.contains_key(&param.name) {
            return Err(ConstructionError::MissingParameter {
                node_id,
                param: param.name.clone(),
            });
        }
    }
    Ok(())
}
