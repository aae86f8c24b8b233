use std::fmt;

use crate::executor::Outcome;

/// Lifecycle of one node within an invocation.
///
/// ```text
/// Pending → Resolving → Ready → Running → {Succeeded | Failed | TimedOut | ExecutionError}
///    └──────────┴─────────┴──→ Failed   (short-circuit / cancellation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    /// Waiting for outstanding dependencies.
    Resolving,
    Ready,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    ExecutionError,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::TimedOut | NodeState::ExecutionError
        )
    }

    /// Not yet running and not finished.
    pub fn is_waiting(self) -> bool {
        matches!(self, NodeState::Pending | NodeState::Resolving | NodeState::Ready)
    }

    pub fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => NodeState::Succeeded,
            Outcome::Failed => NodeState::Failed,
            Outcome::TimedOut => NodeState::TimedOut,
            Outcome::ExecutionError => NodeState::ExecutionError,
        }
    }

    fn allows(self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Pending, Resolving) | (Resolving, Ready) | (Ready, Running) => true,
            (Running, Succeeded | Failed | TimedOut | ExecutionError) => true,
            (Pending | Resolving | Ready, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: NodeState,
    pub to: NodeState,
}

/// States of every node in the graph, indexed by node id.
#[derive(Debug, Clone)]
pub struct StateTable {
    states: Vec<NodeState>,
}

impl StateTable {
    pub fn new(len: usize) -> Self {
        Self {
            states: vec![NodeState::Pending; len],
        }
    }

    pub fn get(&self, id: usize) -> NodeState {
        self.states[id]
    }

    pub fn advance(&mut self, id: usize, next: NodeState) -> Result<(), InvalidTransition> {
        let current = self.states[id];
        if !current.allows(next) {
            return Err(InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.states[id] = next;
        Ok(())
    }

    pub fn all_terminal(&self) -> bool {
        self.states.iter().all(|s| s.is_terminal())
    }
}
