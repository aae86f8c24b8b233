//! Recursive descriptor resolution into a `DependencyGraph`.
//!
//! A three-state depth-first walk (unvisited / in progress / done) loads
//! every reachable descriptor exactly once, rejects cycles before anything
//! runs, and emits nodes in post-order: dependencies first, siblings in
//! the order their parent declares them.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use uuid::Uuid;

use super::DependencyGraph;
use crate::descriptor::{self, SphereDescriptor, SphereIndex};
use crate::error::SphereError;

/// State scoped to a single top-level invocation.
///
/// Holds the descriptor cache (the path → descriptor table) and the
/// identifier index. Nothing here is process-global, so concurrent
/// invocations never share or observe each other's state.
pub struct InvocationContext {
    id: Uuid,
    index: Option<SphereIndex>,
    cache: Mutex<HashMap<PathBuf, Arc<SphereDescriptor>>>,
    loads: AtomicUsize,
}

impl InvocationContext {
    pub fn new(index: Option<SphereIndex>) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            cache: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn index(&self) -> Option<&SphereIndex> {
        self.index.as_ref()
    }

    /// Returns the descriptor at canonical `path`, loading it on first use.
    ///
    /// The table lock is held across the load, so two callers racing on the
    /// same path load it once and share the result.
    pub fn descriptor(&self, path: &Path) -> Result<Arc<SphereDescriptor>, SphereError> {
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = cache.get(path) {
            debug!("Reusing loaded descriptor {}", path.display());
            return Ok(Arc::clone(existing));
        }
        let loaded = Arc::new(descriptor::load(path, self.index.as_ref())?);
        self.loads.fetch_add(1, Ordering::Relaxed);
        cache.insert(path.to_path_buf(), Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Number of descriptor files actually read in this invocation.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

#[derive(Default)]
struct Walk {
    state: HashMap<PathBuf, Visit>,
    stack: Vec<PathBuf>,
    order: Vec<Arc<SphereDescriptor>>,
}

pub struct Resolver<'a> {
    ctx: &'a InvocationContext,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: &'a InvocationContext) -> Self {
        Self { ctx }
    }

    /// Resolves the tree rooted at `root` into an acyclic graph.
    pub fn resolve(&self, root: &Path) -> Result<DependencyGraph, SphereError> {
        let root = std::fs::canonicalize(root).map_err(|e| SphereError::UnresolvedReference {
            reference: root.display().to_string(),
            from: None,
            reason: e.to_string(),
        })?;

        info!("Resolving {} (invocation {})", root.display(), self.ctx.id());
        let mut walk = Walk::default();
        self.visit(&root, &mut walk)?;

        let graph = DependencyGraph::from_ordered(walk.order, &root);
        info!(
            "Resolved {} node(s), fingerprint {}",
            graph.len(),
            graph.fingerprint()
        );
        Ok(graph)
    }

    fn visit(&self, path: &Path, walk: &mut Walk) -> Result<(), SphereError> {
        match walk.state.get(path) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let start = walk.stack.iter().position(|p| p == path).unwrap_or(0);
                let mut cycle = walk.stack[start..].to_vec();
                cycle.push(path.to_path_buf());
                return Err(SphereError::CyclicDependency { cycle });
            }
            None => {}
        }

        walk.state.insert(path.to_path_buf(), Visit::InProgress);
        walk.stack.push(path.to_path_buf());

        let descriptor = self.ctx.descriptor(path)?;
        for reference in &descriptor.dependencies {
            self.visit(&reference.target, walk)?;
        }

        walk.stack.pop();
        walk.state.insert(path.to_path_buf(), Visit::Done);
        walk.order.push(descriptor);
        Ok(())
    }
}
