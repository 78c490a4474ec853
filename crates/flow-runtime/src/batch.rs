//! Breadth-first batch execution.
//!
//! Running a graph item-by-item pays every node's init cost once per item.
//! The batch runner flips the loops: it sweeps one node across the whole
//! batch before moving to the next, so a node's resources are resident for
//! exactly one contiguous window. Between windows the release policy
//! decides whether to evict.

use chrono::Utc;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flow_core::{ExecutionEvent, FlowError, NodeId, StoreError};

use crate::executor::Executor;
use crate::graph::Graph;

/// Knobs for batch failure behavior.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// If true (default), a per-item failure is recorded and the batch
    /// continues with the next item. If false, the first failure aborts.
    pub fault_tolerant: bool,
    /// If true, an init/release failure aborts the whole batch even in
    /// fault-tolerant mode (e.g. the GPU is gone and every item would
    /// fail the same way).
    pub abort_on_resource_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            fault_tolerant: true,
            abort_on_resource_error: false,
        }
    }
}

/// Decides, after a node's sweep completes, whether resources must be
/// freed before the next node's sweep starts.
pub enum ReleasePolicy {
    /// Release after every level. Never wrong, occasionally wasteful for
    /// graphs of cheap nodes.
    AfterEveryNode,
    /// Never release between levels; only the final release runs.
    Never,
    /// Release only after the named nodes (the heavyweights).
    AfterNodes(HashSet<NodeId>),
    /// Arbitrary classification, e.g. "same resource family as the next
    /// node". Receives the finished node and the next node in the sweep.
    Custom(Box<dyn Fn(NodeId, Option<NodeId>) -> bool + Send + Sync>),
}

impl ReleasePolicy {
    fn should_release(&self, current: NodeId, next: Option<NodeId>) -> bool {
        match self {
            ReleasePolicy::AfterEveryNode => true,
            ReleasePolicy::Never => false,
            ReleasePolicy::AfterNodes(ids) => ids.contains(&current),
            ReleasePolicy::Custom(f) => f(current, next),
        }
    }
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        ReleasePolicy::AfterEveryNode
    }
}

/// One failed item: which item, where it failed, and why.
#[derive(Debug)]
pub struct BatchFailure<T> {
    pub item_index: usize,
    pub item: T,
    pub node_id: NodeId,
    pub node_name: String,
    pub error: FlowError,
}

/// Outcome of a batch run.
#[derive(Debug, Default)]
pub struct BatchReport<T> {
    /// Items whose final level completed.
    pub completed: usize,
    pub failures: Vec<BatchFailure<T>>,
    /// True if the run stopped early on the cancellation signal; the
    /// report covers only the work done up to that point.
    pub cancelled: bool,
}

/// Sweeps the executor over a sequence of items, one node level at a time.
pub struct BatchRunner {
    cancel: CancellationToken,
    options: BatchOptions,
    policy: ReleasePolicy,
}

impl BatchRunner {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            options: BatchOptions::default(),
            policy: ReleasePolicy::default(),
        }
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_policy(mut self, policy: ReleasePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `targets` for every item, breadth-first over the topological
    /// order of their ancestors.
    ///
    /// `prepare` runs before each (item, node) evaluation. It must bind the
    /// store to the item's persistence location (`graph.persist(...)`) and
    /// should set any constant nodes from the item; the binding is cleared
    /// beforehand so a `prepare` that forgets to bind is caught immediately.
    pub async fn process_batch<T, F>(
        &self,
        graph: &mut Graph,
        items: Vec<T>,
        targets: &[NodeId],
        mut prepare: F,
    ) -> Result<BatchReport<T>, FlowError>
    where
        T: Clone,
        F: FnMut(usize, &T, &mut Graph) -> Result<(), FlowError>,
    {
        let order = graph.topological_sort(targets)?;
        let run_id = Uuid::new_v4();
        let mut report = BatchReport {
            completed: 0,
            failures: Vec::new(),
            cancelled: false,
        };
        let mut failed: HashSet<usize> = HashSet::new();

        graph.events().emit(ExecutionEvent::BatchStarted {
            run_id,
            items: items.len(),
            levels: order.len(),
            timestamp: Utc::now(),
        });
        tracing::info!(%run_id, items = items.len(), levels = order.len(), "starting batch");

        let executor = Executor::with_cancellation(self.cancel.clone());

        'levels: for (level, &node_id) in order.iter().enumerate() {
            let is_last = level == order.len() - 1;

            for (index, item) in items.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    tracing::warn!(%run_id, "batch cancelled");
                    report.cancelled = true;
                    break 'levels;
                }
                if failed.contains(&index) {
                    tracing::info!(%run_id, item_index = index, "skipping item after earlier failure");
                    continue;
                }

                // Per-item isolation hinges on prepare binding a per-item
                // location; make a missing bind an immediate hard error.
                graph.store_mut().unbind();
                prepare(index, item, graph)?;
                if !graph.store().is_bound() {
                    return Err(StoreError::NotBound.into());
                }

                match executor.run_upto(graph, node_id).await {
                    Ok(_) => {
                        if is_last {
                            report.completed += 1;
                        }
                    }
                    Err(FlowError::Cancelled) => {
                        report.cancelled = true;
                        break 'levels;
                    }
                    Err(error) => {
                        let node_name = graph
                            .node_name(node_id)
                            .unwrap_or_default()
                            .to_string();
                        tracing::warn!(
                            %run_id,
                            item_index = index,
                            node_id,
                            node_name,
                            error = %error,
                            "item failed"
                        );
                        graph.events().emit(ExecutionEvent::BatchItemFailed {
                            run_id,
                            item_index: index,
                            node_id,
                            error: error.to_string(),
                            timestamp: Utc::now(),
                        });

                        let abort = !self.options.fault_tolerant
                            || (self.options.abort_on_resource_error
                                && matches!(error, FlowError::Resource(_)));
                        if abort {
                            if let Err(release_err) = graph.release_resources().await {
                                tracing::error!(error = %release_err, "release after abort failed");
                            }
                            return Err(error);
                        }

                        failed.insert(index);
                        report.failures.push(BatchFailure {
                            item_index: index,
                            item: item.clone(),
                            node_id,
                            node_name,
                            error,
                        });
                    }
                }
            }

            let next = order.get(level + 1).copied();
            if next.is_some() && self.policy.should_release(node_id, next) {
                graph.release_resources().await?;
            }
        }

        // Resources never outlive the batch.
        graph.release_resources().await?;

        graph.events().emit(ExecutionEvent::BatchCompleted {
            run_id,
            completed: report.completed,
            failed: report.failures.len(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            %run_id,
            completed = report.completed,
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "batch finished"
        );
        Ok(report)
    }
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new()
    }
}
