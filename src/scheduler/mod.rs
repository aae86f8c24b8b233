//! Worker-pool scheduler over a resolved dependency graph.
//!
//! The scheduling loop owns all bookkeeping (states, pending-dependency
//! counters, the ready queue). Each dispatched node runs on its own runtime
//! task, which reports back over a completion channel; the loop sleeps only
//! on that channel. A node becomes Ready when its last outstanding
//! dependency succeeds, and is short-circuited as soon as any dependency
//! fails.
pub mod state;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{InvocationReport, ResultAggregator};
use crate::descriptor::SphereDescriptor;
use crate::error::SphereError;
use crate::executor::{ExecutionResult, ProcessExecutor};
use crate::graph::{DependencyGraph, NodeId};
use crate::sandbox::{DependencyInput, SandboxConstructor};

pub use state::{InvalidTransition, NodeState, StateTable};

/// Sent by a node task when its node reaches a terminal state.
struct Completion {
    id: NodeId,
    result: ExecutionResult,
}

pub struct Scheduler {
    workers: usize,
    cancel_on_first_failure: bool,
    constructor: Arc<SandboxConstructor>,
    executor: Arc<ProcessExecutor>,
}

impl Scheduler {
    pub fn new(
        workers: usize,
        cancel_on_first_failure: bool,
        constructor: Arc<SandboxConstructor>,
        executor: Arc<ProcessExecutor>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            cancel_on_first_failure,
            constructor,
            executor,
        }
    }

    /// Runs every node of `graph` to a terminal state.
    pub async fn run(&self, graph: Arc<DependencyGraph>, invocation: Uuid) -> InvocationReport {
        info!(
            "Scheduling {} node(s) on {} worker(s)",
            graph.len(),
            self.workers
        );
        let (tx, mut rx) = mpsc::channel::<Completion>(graph.len().max(1));
        let mut run = Run::new(Arc::clone(&graph), self.cancel_on_first_failure);

        loop {
            self.dispatch(&mut run, &tx);
            if run.running.is_empty() {
                break;
            }
            let Some(Completion { id, result }) = rx.recv().await else {
                break;
            };
            run.running.remove(&id);
            run.complete(id, result);
        }

        run.abandon_unfinished();
        run.aggregator.finish(invocation)
    }

    /// Starts Ready nodes until the pool is full or nothing else can start.
    fn dispatch(&self, run: &mut Run, tx: &mpsc::Sender<Completion>) {
        while run.running.len() < self.workers {
            let Some(id) = run.next_dispatchable() else {
                break;
            };
            run.ready.remove(&id);
            run.advance(id, NodeState::Running);
            run.running.insert(id);

            let inputs = run.aggregator.inputs_for(id);
            let descriptor = Arc::clone(&run.graph.node(id).descriptor);
            let constructor = Arc::clone(&self.constructor);
            let executor = Arc::clone(&self.executor);
            let tx = tx.clone();

            debug!("Dispatching {}", descriptor.name());
            tokio::spawn(async move {
                let node = descriptor.location.clone();
                // Nested task: a panic in one node becomes that node's ExecutionError
                let task = tokio::spawn(run_node(constructor, executor, descriptor, inputs));
                let result = match task.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Task for {} failed: {e}", node.display());
                        ExecutionResult::errored(node, format!("node task failed: {e}"))
                    }
                };
                if tx.send(Completion { id, result }).await.is_err() {
                    debug!("Scheduler gone, dropping completion");
                }
            });
        }
    }
}

/// Builds the sandbox, runs the entrypoint, tears the sandbox down.
async fn run_node(
    constructor: Arc<SandboxConstructor>,
    executor: Arc<ProcessExecutor>,
    descriptor: Arc<SphereDescriptor>,
    inputs: Vec<DependencyInput>,
) -> ExecutionResult {
    let node = descriptor.location.clone();
    let ctx = match constructor.build(descriptor, &inputs) {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!("Failed to prepare sandbox for {}: {e}", node.display());
            return match e {
                SphereError::ExecutionError { reason, .. } => ExecutionResult::errored(node, reason),
                other => ExecutionResult::not_run(node, other),
            };
        }
    };
    let result = executor.execute(&ctx).await;
    ctx.teardown();
    result
}

/// Bookkeeping of one invocation, owned by the scheduling loop.
struct Run {
    graph: Arc<DependencyGraph>,
    states: StateTable,
    /// Outstanding (not yet succeeded) dependencies per node.
    pending: Vec<usize>,
    /// Ordered by node id, which is topological order.
    ready: BTreeSet<NodeId>,
    running: BTreeSet<NodeId>,
    aggregator: ResultAggregator,
    cancel_on_first_failure: bool,
    cancelled: bool,
}

impl Run {
    fn new(graph: Arc<DependencyGraph>, cancel_on_first_failure: bool) -> Self {
        let mut run = Self {
            states: StateTable::new(graph.len()),
            pending: graph.nodes().map(|n| n.dependencies.len()).collect(),
            ready: BTreeSet::new(),
            running: BTreeSet::new(),
            aggregator: ResultAggregator::new(Arc::clone(&graph)),
            cancel_on_first_failure,
            cancelled: false,
            graph,
        };
        for id in 0..run.graph.len() {
            run.advance(id, NodeState::Resolving);
            if run.pending[id] == 0 {
                run.advance(id, NodeState::Ready);
                run.ready.insert(id);
            }
        }
        run
    }

    fn name(&self, id: NodeId) -> String {
        self.graph.node(id).descriptor.name()
    }

    fn advance(&mut self, id: NodeId, next: NodeState) {
        if let Err(e) = self.states.advance(id, next) {
            error!("{}: {e}", self.name(id));
        }
    }

    /// First Ready node whose write grants do not overlap a running node's.
    fn next_dispatchable(&self) -> Option<NodeId> {
        self.ready.iter().copied().find(|&candidate| {
            let grants = &self.graph.node(candidate).descriptor.grants;
            let blocker = self
                .running
                .iter()
                .find(|&&r| grants.write_overlaps(&self.graph.node(r).descriptor.grants));
            if let Some(&blocker) = blocker {
                debug!(
                    "Holding {}: write grants overlap running {}",
                    self.name(candidate),
                    self.name(blocker)
                );
                return false;
            }
            true
        })
    }

    fn complete(&mut self, id: NodeId, result: ExecutionResult) {
        self.advance(id, NodeState::from_outcome(result.outcome));
        let succeeded = result.outcome.is_success();
        self.aggregator.record(id, result);

        let graph = Arc::clone(&self.graph);
        if succeeded {
            for &dependent in &graph.node(id).dependents {
                self.pending[dependent] = self.pending[dependent].saturating_sub(1);
                if self.pending[dependent] == 0 && self.states.get(dependent) == NodeState::Resolving {
                    self.advance(dependent, NodeState::Ready);
                    self.ready.insert(dependent);
                }
            }
            return;
        }

        let failed = graph.node(id).path().to_path_buf();
        warn!("{} failed, skipping its dependents", self.name(id));
        for dependent in graph.transitive_dependents(id) {
            if self.states.get(dependent).is_waiting() {
                let error = SphereError::DependencyFailed {
                    node: graph.node(dependent).path().to_path_buf(),
                    failed: failed.clone(),
                };
                self.short_circuit(dependent, error);
            }
        }

        if self.cancel_on_first_failure && !self.cancelled {
            self.cancelled = true;
            for other in 0..graph.len() {
                if self.states.get(other).is_waiting() {
                    let error = SphereError::Cancelled {
                        node: graph.node(other).path().to_path_buf(),
                        trigger: failed.clone(),
                    };
                    self.short_circuit(other, error);
                }
            }
        }
    }

    /// Moves a not-yet-started node straight to Failed without running it.
    fn short_circuit(&mut self, id: NodeId, error: SphereError) {
        info!("Skipping {}: {error}", self.name(id));
        self.ready.remove(&id);
        self.advance(id, NodeState::Failed);
        self.aggregator.release_dependencies(id);
        let node = self.graph.node(id).path().to_path_buf();
        self.aggregator.record(id, ExecutionResult::not_run(node, error));
    }

    /// Records any node the loop never finished. Unreachable for a graph
    /// built by the resolver; kept so the report is always complete.
    fn abandon_unfinished(&mut self) {
        for id in 0..self.graph.len() {
            if !self.aggregator.is_recorded(id) {
                error!("{} never reached a terminal state", self.name(id));
                let node = self.graph.node(id).path().to_path_buf();
                self.aggregator
                    .record(id, ExecutionResult::errored(node, "node was never scheduled"));
            }
        }
    }
}
