//! Sphere: resolves declarative `.sphere` descriptors into a dependency
//! graph and runs every node in its own capability-scoped sandbox.
//!
//! ```text
//! descriptor ─▶ resolver ─▶ graph ─▶ scheduler ─▶ sandbox ─▶ executor
//!                                        ▲                       │
//!                                        └──── aggregator ◀──────┘
//! ```
pub mod aggregate;
pub mod capability;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod exports;
pub mod graph;
pub mod sandbox;
pub mod scheduler;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use aggregate::{InvocationReport, NodeSummary};
pub use config::Config;
pub use error::{ErrorKind, SphereError};
pub use executor::{ExecutionResult, Outcome};
pub use graph::{DependencyGraph, InvocationContext};

use crate::descriptor::SphereIndex;
use crate::executor::ProcessExecutor;
use crate::graph::Resolver;
use crate::sandbox::{SandboxBackend, SandboxConstructor};
use crate::scheduler::Scheduler;

/// Entry point for running descriptor trees.
///
/// An `Engine` holds only configuration and the sandbox backend. All
/// per-run state lives in the `InvocationContext` created for each call, so
/// one engine can serve concurrent invocations.
pub struct Engine {
    config: Config,
    backend: Arc<dyn SandboxBackend>,
}

impl Engine {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let backend = sandbox::backend_for(&config.sandbox)?;
        info!("Sandbox backend: {}", backend.name());
        Ok(Self { config, backend })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh context for one top-level invocation.
    pub fn context(&self) -> InvocationContext {
        InvocationContext::new(Some(SphereIndex::new(&self.config.registry.cache_dir)))
    }

    /// Loads the descriptor tree rooted at `root` without running anything.
    pub fn resolve(&self, ctx: &InvocationContext, root: &Path) -> Result<DependencyGraph, SphereError> {
        Resolver::new(ctx).resolve(root)
    }

    /// Resolves and runs the tree rooted at `root`.
    ///
    /// Resolution failures (malformed descriptors, bad grants, cycles,
    /// unresolved references) are returned as `Err` before any node runs.
    /// Execution failures are part of the returned report.
    pub async fn run(&self, root: &Path) -> Result<InvocationReport, SphereError> {
        let ctx = self.context();
        let graph = Arc::new(self.resolve(&ctx, root)?);
        Ok(self.scheduler().run(graph, ctx.id()).await)
    }

    fn scheduler(&self) -> Scheduler {
        let executor = ProcessExecutor::new(
            Arc::clone(&self.backend),
            self.config.engine.shell.clone(),
            Duration::from_millis(self.config.sandbox.memory_sample_ms),
        );
        Scheduler::new(
            self.config.engine.workers,
            self.config.engine.cancel_on_first_failure,
            Arc::new(SandboxConstructor::new(self.config.sandbox.clone())),
            Arc::new(executor),
        )
    }
}
