//! Result aggregation: per-node results, export hand-off and the final report.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorKind, SphereError};
use crate::executor::{serialize_millis, ExecutionResult, Outcome};
use crate::exports::Exports;
use crate::graph::{DependencyGraph, NodeId};
use crate::sandbox::DependencyInput;

/// What is kept about every node once its full result is discarded.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub node: PathBuf,
    pub name: String,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub error: Option<SphereError>,
    /// Captured stderr, kept only for nodes that ran and did not succeed.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl NodeSummary {
    fn new(name: String, result: &ExecutionResult) -> Self {
        let stderr = if result.outcome.is_success() {
            String::new()
        } else {
            result.stderr.clone()
        };
        Self {
            node: result.node.clone(),
            name,
            outcome: result.outcome,
            exit_code: result.exit_code,
            duration: result.duration,
            error: result.error.clone(),
            stderr,
        }
    }

    /// Whether this node failed on its own rather than because of another node.
    pub fn is_origin_failure(&self) -> bool {
        !self.outcome.is_success()
            && !matches!(
                self.error.as_ref().map(SphereError::kind),
                Some(ErrorKind::DependencyFailed) | Some(ErrorKind::Cancelled)
            )
    }
}

/// Collects terminal results and hands exports from producers to consumers.
///
/// A node's exports are held only until every direct dependent has either
/// read them or been short-circuited.
pub struct ResultAggregator {
    graph: Arc<DependencyGraph>,
    summaries: Vec<Option<NodeSummary>>,
    exports: HashMap<NodeId, Arc<Exports>>,
    remaining_consumers: Vec<usize>,
    root: Option<ExecutionResult>,
}

impl ResultAggregator {
    pub fn new(graph: Arc<DependencyGraph>) -> Self {
        let remaining_consumers = graph.nodes().map(|n| n.dependents.len()).collect();
        Self {
            summaries: vec![None; graph.len()],
            exports: HashMap::new(),
            remaining_consumers,
            root: None,
            graph,
        }
    }

    pub fn is_recorded(&self, id: NodeId) -> bool {
        self.summaries[id].is_some()
    }

    /// Records the terminal result of `id`.
    pub fn record(&mut self, id: NodeId, mut result: ExecutionResult) {
        let node = self.graph.node(id);
        self.summaries[id] = Some(NodeSummary::new(node.descriptor.name(), &result));

        // The root has no consumers, so its result keeps its exports
        if result.outcome.is_success() && self.remaining_consumers[id] > 0 {
            self.exports
                .insert(id, Arc::new(std::mem::take(&mut result.exports)));
        }
        if id == self.graph.root() {
            self.root = Some(result);
        }
    }

    /// Exports of the direct dependencies of `id`, in declaration order.
    /// Each dependency's snapshot is released for this consumer.
    pub fn inputs_for(&mut self, id: NodeId) -> Vec<DependencyInput> {
        let graph = Arc::clone(&self.graph);
        let node = graph.node(id);
        let inputs = node
            .dependencies
            .iter()
            .map(|edge| DependencyInput {
                alias: edge.alias.clone(),
                entrypoint: graph.node(edge.target).descriptor.entrypoint.clone(),
                exports: self
                    .exports
                    .get(&edge.target)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        self.release_dependencies(id);
        inputs
    }

    /// Marks `id` as no longer needing its dependencies' exports.
    pub fn release_dependencies(&mut self, id: NodeId) {
        let graph = Arc::clone(&self.graph);
        for edge in &graph.node(id).dependencies {
            let remaining = &mut self.remaining_consumers[edge.target];
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 && self.exports.remove(&edge.target).is_some() {
                debug!("Dropped exports of {}", graph.node(edge.target).descriptor.name());
            }
        }
    }

    /// Number of export snapshots still held.
    pub fn held_exports(&self) -> usize {
        self.exports.len()
    }

    /// The earliest origin failure in topological order.
    pub fn first_failure(&self) -> Option<&NodeSummary> {
        self.summaries
            .iter()
            .flatten()
            .find(|s| s.is_origin_failure())
            .or_else(|| {
                self.summaries
                    .iter()
                    .flatten()
                    .find(|s| !s.outcome.is_success())
            })
    }

    pub fn finish(self, invocation: Uuid) -> InvocationReport {
        let first_failure = self.first_failure().cloned();
        let root_path = self.graph.node(self.graph.root()).path().to_path_buf();
        let root = self.root.unwrap_or_else(|| {
            ExecutionResult::errored(root_path, "root node never reached a terminal state")
        });
        InvocationReport {
            invocation,
            fingerprint: self.graph.fingerprint(),
            root,
            nodes: self.summaries.into_iter().flatten().collect(),
            first_failure,
        }
    }
}

/// Outcome of one top-level invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationReport {
    pub invocation: Uuid,
    pub fingerprint: String,
    /// The root node's full result: the invocation's own result.
    pub root: ExecutionResult,
    /// Every node, in topological order.
    pub nodes: Vec<NodeSummary>,
    pub first_failure: Option<NodeSummary>,
}

impl InvocationReport {
    pub fn succeeded(&self) -> bool {
        self.root.outcome.is_success()
    }

    /// Process exit code: the root's own status when it exited, otherwise
    /// the reserved code of the root's failure kind.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.root.exit_code {
            return code;
        }
        match self.root.error {
            Some(ref e) => e.kind().exit_code(),
            None => 0,
        }
    }

    pub fn summary(&self, id: NodeId) -> Option<&NodeSummary> {
        self.nodes.get(id)
    }
}
