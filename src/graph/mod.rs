//! Dependency graph of one invocation.
//!
//! Nodes are keyed by canonical descriptor path, so a descriptor reached
//! along several paths (a diamond) is one node. Nodes are stored in
//! topological order: every node comes after all of its dependencies.

pub mod resolver;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::capability::FilesystemGrant;
use crate::descriptor::SphereDescriptor;

pub use resolver::{InvocationContext, Resolver};

/// Index of a node in the graph's topological order.
pub type NodeId = usize;

/// "Depends on" edge from a node to one of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub target: NodeId,
    /// Namespace of the dependency's exports in the dependent's environment.
    pub alias: String,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub descriptor: Arc<SphereDescriptor>,
    /// In the descriptor's declaration order.
    pub dependencies: Vec<Edge>,
    /// Nodes that list this one as a dependency, in topological order.
    pub dependents: Vec<NodeId>,
}

impl Node {
    pub fn path(&self) -> &Path {
        &self.descriptor.location
    }
}

/// An acyclic dependency graph with a single root.
///
/// Built only by [`Resolver`], which guarantees acyclicity and
/// one-node-per-canonical-path.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<PathBuf, NodeId>,
    root: NodeId,
}

impl DependencyGraph {
    /// Builds the graph from descriptors already in topological order
    /// (dependencies first) and the root path.
    pub(crate) fn from_ordered(ordered: Vec<Arc<SphereDescriptor>>, root: &Path) -> Self {
        let index: HashMap<PathBuf, NodeId> = ordered
            .iter()
            .enumerate()
            .map(|(i, d)| (d.location.clone(), i))
            .collect();

        let mut nodes: Vec<Node> = ordered
            .into_iter()
            .enumerate()
            .map(|(id, descriptor)| {
                let dependencies = descriptor
                    .dependencies
                    .iter()
                    .filter_map(|r| {
                        index.get(&r.target).map(|&target| Edge {
                            target,
                            alias: r.alias.clone(),
                        })
                    })
                    .collect();
                Node {
                    id,
                    descriptor,
                    dependencies,
                    dependents: Vec::new(),
                }
            })
            .collect();

        for id in 0..nodes.len() {
            let targets: Vec<NodeId> = nodes[id].dependencies.iter().map(|e| e.target).collect();
            for target in targets {
                nodes[target].dependents.push(id);
            }
        }

        let root = index.get(root).copied().unwrap_or(nodes.len().saturating_sub(1));
        Self { nodes, index, root }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn get(&self, path: &Path) -> Option<&Node> {
        self.index.get(path).map(|&id| &self.nodes[id])
    }

    /// Nodes in topological order: dependencies before dependents, ties in
    /// declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Canonical paths in execution order.
    pub fn order(&self) -> Vec<&Path> {
        self.nodes.iter().map(Node::path).collect()
    }

    pub fn node_set(&self) -> BTreeSet<PathBuf> {
        self.index.keys().cloned().collect()
    }

    /// `(dependent, dependency)` pairs.
    pub fn edge_set(&self) -> BTreeSet<(PathBuf, PathBuf)> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.dependencies
                    .iter()
                    .map(move |e| (n.path().to_path_buf(), self.nodes[e.target].path().to_path_buf()))
            })
            .collect()
    }

    /// `(node, grant)` pairs.
    pub fn grant_set(&self) -> BTreeSet<(PathBuf, FilesystemGrant)> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.descriptor
                    .grants
                    .iter()
                    .map(move |g| (n.path().to_path_buf(), g.clone()))
            })
            .collect()
    }

    /// Every node that depends on `id`, directly or transitively, in
    /// topological order.
    pub fn transitive_dependents(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = self.nodes[id].dependents.iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.nodes[next].dependents.iter().copied());
            }
        }
        seen.into_iter().collect()
    }

    /// Stable SHA-1 over nodes, edges, grants and entrypoints.
    ///
    /// Two loads of the same descriptor tree produce the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha1::new();
        for node in &self.nodes {
            hasher.update(b"node\0");
            hasher.update(node.path().to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(node.descriptor.entrypoint.as_bytes());
            for edge in &node.dependencies {
                hasher.update(b"\0edge\0");
                hasher.update(edge.alias.as_bytes());
                hasher.update(b"\0");
                hasher.update(self.nodes[edge.target].path().to_string_lossy().as_bytes());
            }
            for grant in node.descriptor.grants.iter() {
                hasher.update(b"\0grant\0");
                hasher.update(grant.path.to_string_lossy().as_bytes());
                hasher.update(b"\0");
                hasher.update(grant.mode.as_str().as_bytes());
            }
            for export in &node.descriptor.exports {
                hasher.update(b"\0export\0");
                hasher.update(export.as_bytes());
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}
