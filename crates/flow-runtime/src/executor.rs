//! Single-target execution: topological walk, cache-hit detection,
//! invocation, and persistence.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flow_core::fingerprint::{constant_fingerprint, processor_fingerprint};
use flow_core::{
    EventBus, ExecutionEvent, Fingerprint, FlowError, InputDigest, Inputs, NodeFailure, NodeId,
    ResourceFailure, ResourcePhase, RunId, Value,
};

use crate::graph::{validate_values, Binding, Graph, NodeSlot, ProcessorSlot};
use crate::store::ValueStore;

/// Drives a single `run_upto` over a graph.
///
/// Execution is strictly serial: nodes run in topological order and no two
/// `process` calls overlap. The cancellation token is observed between
/// nodes; individual processors may additionally honor it mid-computation.
pub struct Executor {
    cancel: CancellationToken,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Evaluate `target` and all of its ancestors, reusing cached outputs
    /// where fingerprints match, and return the target's output.
    pub async fn run_upto(&self, graph: &mut Graph, target: NodeId) -> Result<Value, FlowError> {
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let order = graph.topological_sort(&[target])?;

        graph.events().emit(ExecutionEvent::RunStarted {
            run_id,
            target,
            timestamp: Utc::now(),
        });
        tracing::info!(%run_id, target, nodes = order.len(), "starting run");

        let mut outputs: HashMap<NodeId, (Fingerprint, Value)> = HashMap::new();
        let mut result = Ok(());
        for &id in &order {
            if self.cancel.is_cancelled() {
                tracing::warn!(%run_id, target, "run cancelled");
                result = Err(FlowError::Cancelled);
                break;
            }
            if let Err(err) = self.run_node(graph, run_id, id, &mut outputs).await {
                result = Err(err);
                break;
            }
        }

        graph.events().emit(ExecutionEvent::RunCompleted {
            run_id,
            success: result.is_ok(),
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
        result?;

        let (_, value) = outputs
            .remove(&target)
            .expect("target evaluated by topological walk");
        Ok(value)
    }

    async fn run_node(
        &self,
        graph: &mut Graph,
        run_id: RunId,
        id: NodeId,
        outputs: &mut HashMap<NodeId, (Fingerprint, Value)>,
    ) -> Result<(), FlowError> {
        let (nodes, store, events) = graph.parts_mut();
        let slot = nodes.get_mut(&id).expect("node listed by topological sort");
        match slot {
            NodeSlot::Constant(c) => {
                let fingerprint = constant_fingerprint(&c.name, &c.value);
                if store.lookup(id, &c.name, &fingerprint)?.is_none() {
                    let raw = serde_json::to_value(&c.value)
                        .map_err(|err| FlowError::Store(err.into()))?;
                    store.store(id, &c.name, fingerprint.clone(), raw, None)?;
                }
                outputs.insert(id, (fingerprint, c.value.clone()));
                Ok(())
            }
            NodeSlot::Processor(p) => {
                self.run_processor(run_id, id, p, store, events, outputs).await
            }
        }
    }

    async fn run_processor(
        &self,
        run_id: RunId,
        id: NodeId,
        slot: &mut ProcessorSlot,
        store: &mut ValueStore,
        events: &EventBus,
        outputs: &mut HashMap<NodeId, (Fingerprint, Value)>,
    ) -> Result<(), FlowError> {
        let name = slot.kind.name().to_string();

        // Resolve bindings. References must already have an output thanks
        // to the topological order; they contribute their fingerprint to
        // this node's fingerprint, not their value.
        let (resolved, fingerprint) = {
            let mut resolved: BTreeMap<String, Value> = BTreeMap::new();
            let mut digests: BTreeMap<String, InputDigest<'_>> = BTreeMap::new();
            for (param, binding) in &slot.bindings {
                match binding {
                    Binding::Literal(value) => {
                        digests.insert(param.clone(), InputDigest::Literal(value));
                        resolved.insert(param.clone(), value.clone());
                    }
                    Binding::Node(referent) => {
                        let (fp, value) = outputs
                            .get(referent)
                            .expect("ancestor computed before dependent");
                        digests.insert(param.clone(), InputDigest::Upstream(fp));
                        resolved.insert(param.clone(), value.clone());
                    }
                }
            }
            let fingerprint =
                processor_fingerprint(slot.kind.name(), slot.kind.version(), &digests);
            (resolved, fingerprint)
        };

        if let Some(raw) = store.lookup(id, &name, &fingerprint)? {
            let value = slot.kind.decode(raw).map_err(|source| NodeFailure {
                node_id: id,
                name: name.clone(),
                fingerprint: fingerprint.clone(),
                source,
            })?;
            tracing::info!(%run_id, node_id = id, name, "cache hit, adopting stored output");
            events.emit(ExecutionEvent::NodeCached {
                run_id,
                node_id: id,
                name,
                timestamp: Utc::now(),
            });
            outputs.insert(id, (fingerprint, value));
            return Ok(());
        }

        if !slot.inputs_validated {
            validate_values(id, &slot.kind.signature(), &resolved)?;
            slot.inputs_validated = true;
        }

        events.emit(ExecutionEvent::NodeStarted {
            run_id,
            node_id: id,
            name: name.clone(),
            timestamp: Utc::now(),
        });

        if slot.instance.is_none() {
            tracing::info!(%run_id, node_id = id, name, "initializing node");
            let mut instance =
                slot.kind
                    .create(&slot.config)
                    .map_err(|source| ResourceFailure {
                        node_id: id,
                        name: name.clone(),
                        phase: ResourcePhase::Init,
                        source,
                    })?;
            instance.init().await.map_err(|source| ResourceFailure {
                node_id: id,
                name: name.clone(),
                phase: ResourcePhase::Init,
                source,
            })?;
            slot.instance = Some(instance);
        }

        let instance = slot.instance.as_mut().expect("instance initialized above");
        let inputs = Inputs::new(resolved);
        let start = Instant::now();
        match instance.process(&inputs).await {
            Ok(value) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                let raw = slot.kind.encode(&value).map_err(|source| NodeFailure {
                    node_id: id,
                    name: name.clone(),
                    fingerprint: fingerprint.clone(),
                    source,
                })?;
                store.store(id, &name, fingerprint.clone(), raw, Some(elapsed_ms))?;
                tracing::info!(%run_id, node_id = id, name, elapsed_ms, "node completed");
                events.emit(ExecutionEvent::NodeCompleted {
                    run_id,
                    node_id: id,
                    duration_ms: elapsed_ms,
                    timestamp: Utc::now(),
                });
                outputs.insert(id, (fingerprint, value));
                Ok(())
            }
            Err(source) => {
                tracing::error!(%run_id, node_id = id, name, error = %source, "node failed");
                events.emit(ExecutionEvent::NodeFailed {
                    run_id,
                    node_id: id,
                    error: source.to_string(),
                    timestamp: Utc::now(),
                });
                Err(NodeFailure {
                    node_id: id,
                    name,
                    fingerprint,
                    source,
                }
                .into())
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}
