//! Execution sandbox: one isolated root per node.
//!
//! The security model is layered:
//!
//! 1. Declarative grants (TOML): validated when the descriptor loads
//! 2. Entrypoint audit: every path the command touches is checked against
//!    the node's own grants before anything is spawned
//! 3. Backend isolation: `portable` runs the audited command directly in
//!    its sandbox root; `native` also confines it with bubblewrap
//!
//! A sandbox is built immediately before its node runs and torn down right
//! after. The root is a `TempDir`, so dropping the context removes it on
//! every exit path.
pub mod native;
pub mod portable;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::capability::{audit, CapabilityGuard};
use crate::config::{BackendKind, SandboxConfig};
use crate::descriptor::SphereDescriptor;
use crate::error::SphereError;
use crate::exports::{env_key, Exports};

pub use native::NativeBackend;
pub use portable::PortableBackend;

const EXPORTS_FILE: &str = "exports";
const INPUTS_FILE: &str = "inputs.json";
const STATE_DIR: &str = ".sphere";

/// An isolation backend.
///
/// Both backends enforce the same grants; they differ in how strongly the
/// running process is confined.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short name used in logs and config ("portable", "native").
    fn name(&self) -> &str;

    /// Checks the node's commands against its grants. Runs before spawn;
    /// a denial means the entrypoint never starts.
    async fn enforce(&self, ctx: &ExecutionContext) -> Result<(), SphereError>;

    /// Builds the command that runs `<shell> -c <entrypoint>` for this node.
    /// The caller sets environment, working directory and stdio.
    fn command(&self, shell: &str, ctx: &ExecutionContext) -> Command;
}

/// Builds the configured backend. Fails if the native backend is requested
/// but `bwrap` is not installed.
pub fn backend_for(config: &SandboxConfig) -> anyhow::Result<Arc<dyn SandboxBackend>> {
    match config.backend {
        BackendKind::Portable => Ok(Arc::new(PortableBackend)),
        BackendKind::Native => Ok(Arc::new(NativeBackend::locate()?)),
    }
}

/// What a node receives from one of its direct dependencies.
#[derive(Debug, Clone)]
pub struct DependencyInput {
    pub alias: String,
    pub entrypoint: String,
    pub exports: Arc<Exports>,
}

/// An executable `<root>/bin/<alias>` script running a dependency's entrypoint.
#[derive(Debug, Clone)]
pub struct Shim {
    pub alias: String,
    pub entrypoint: String,
}

/// The prepared sandbox of one node.
#[derive(Debug)]
pub struct ExecutionContext {
    pub descriptor: Arc<SphereDescriptor>,
    /// Fully merged environment. The process sees nothing else.
    pub env: BTreeMap<String, String>,
    pub shims: Vec<Shim>,
    root: TempDir,
    /// Canonical form of `root.path()`.
    root_path: PathBuf,
}

impl ExecutionContext {
    pub fn node(&self) -> &Path {
        &self.descriptor.location
    }

    /// Working directory and `HOME` of the process.
    pub fn root(&self) -> &Path {
        &self.root_path
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root_path.join("tmp")
    }

    pub fn exports_path(&self) -> PathBuf {
        self.root_path.join(STATE_DIR).join(EXPORTS_FILE)
    }

    pub fn inputs_path(&self) -> PathBuf {
        self.root_path.join(STATE_DIR).join(INPUTS_FILE)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root_path.join("bin")
    }

    /// Audits the entrypoint (and every shim it may call) against the node's grants.
    pub fn audit(&self) -> Result<(), SphereError> {
        let guard = CapabilityGuard::new(self.node(), &self.descriptor.grants, self.root());
        let commands =
            std::iter::once(&self.descriptor.entrypoint).chain(self.shims.iter().map(|s| &s.entrypoint));
        for command in commands {
            let accesses = audit::scan(command, &self.env).map_err(|e| SphereError::ExecutionError {
                node: self.node().to_path_buf(),
                reason: format!("entrypoint cannot be parsed: {e}"),
            })?;
            debug!("{}: {} access(es) to check", self.node().display(), accesses.len());
            guard.check_all(&accesses)?;
        }
        Ok(())
    }

    /// Removes the sandbox root. Errors are logged, never propagated:
    /// a failed cleanup does not change the node's outcome.
    pub fn teardown(self) {
        let root = self.root_path.clone();
        match self.root.close() {
            Ok(()) => debug!("Removed sandbox {}", root.display()),
            Err(e) => warn!("Failed to remove sandbox {}: {e}", root.display()),
        }
    }
}

/// Creates per-node sandboxes.
pub struct SandboxConstructor {
    config: SandboxConfig,
    /// Snapshot of the inherited host variables, taken once.
    host_env: BTreeMap<String, String>,
}

impl SandboxConstructor {
    pub fn new(config: SandboxConfig) -> Self {
        let host_env = config
            .inherit_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();
        Self::with_host_env(config, host_env)
    }

    pub fn with_host_env(config: SandboxConfig, host_env: BTreeMap<String, String>) -> Self {
        Self { config, host_env }
    }

    /// Builds the sandbox for `descriptor`, given the exports of its direct
    /// dependencies in declaration order.
    pub fn build(
        &self,
        descriptor: Arc<SphereDescriptor>,
        inputs: &[DependencyInput],
    ) -> Result<ExecutionContext, SphereError> {
        let node = descriptor.location.clone();
        let io_error = |what: &str, e: std::io::Error| SphereError::ExecutionError {
            node: node.clone(),
            reason: format!("failed to {what}: {e}"),
        };

        let mut builder = tempfile::Builder::new();
        builder.prefix("sphere-");
        let root = match self.config.root_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir).map_err(|e| io_error("create sandbox parent", e))?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| io_error("create sandbox root", e))?;
        let root_path =
            std::fs::canonicalize(root.path()).map_err(|e| io_error("resolve sandbox root", e))?;

        let shims: Vec<Shim> = if self.config.dependency_shims {
            inputs
                .iter()
                .map(|i| Shim {
                    alias: i.alias.clone(),
                    entrypoint: i.entrypoint.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut ctx = ExecutionContext {
            descriptor,
            env: BTreeMap::new(),
            shims,
            root,
            root_path,
        };

        std::fs::create_dir_all(ctx.tmp_dir()).map_err(|e| io_error("create tmp dir", e))?;
        std::fs::create_dir_all(ctx.root().join(STATE_DIR))
            .map_err(|e| io_error("create state dir", e))?;
        write_inputs(&ctx.inputs_path(), inputs).map_err(|e| io_error("write inputs", e))?;
        if !ctx.shims.is_empty() {
            write_shims(&ctx.bin_dir(), &ctx.shims).map_err(|e| io_error("write shims", e))?;
        }

        ctx.env = self.merge_env(&ctx, inputs)?;
        info!("Sandbox for {} at {}", ctx.descriptor.name(), ctx.root().display());
        Ok(ctx)
    }

    /// Host allowlist, then sandbox-required entries, then descriptor
    /// entries (additive only), then dependency exports.
    fn merge_env(
        &self,
        ctx: &ExecutionContext,
        inputs: &[DependencyInput],
    ) -> Result<BTreeMap<String, String>, SphereError> {
        let mut env = self.host_env.clone();

        let root = ctx.root().to_string_lossy().into_owned();
        env.insert("HOME".to_string(), root.clone());
        env.insert("TMPDIR".to_string(), ctx.tmp_dir().to_string_lossy().into_owned());
        env.insert("SPHERE_ROOT".to_string(), root);
        env.insert(
            "SPHERE_EXPORTS".to_string(),
            ctx.exports_path().to_string_lossy().into_owned(),
        );
        env.insert(
            "SPHERE_INPUTS".to_string(),
            ctx.inputs_path().to_string_lossy().into_owned(),
        );
        env.insert("SPHERE_NODE".to_string(), ctx.node().to_string_lossy().into_owned());
        if !ctx.shims.is_empty() {
            let bin = ctx.bin_dir().to_string_lossy().into_owned();
            let path = match env.get("PATH") {
                Some(existing) if !existing.is_empty() => format!("{bin}:{existing}"),
                _ => bin,
            };
            env.insert("PATH".to_string(), path);
        }

        for (key, value) in &ctx.descriptor.env {
            if env.contains_key(key) {
                warn!(
                    "{}: env '{key}' would override an inherited value, keeping the original",
                    ctx.descriptor.name()
                );
                continue;
            }
            env.insert(key.clone(), value.clone());
        }

        let mut injected: BTreeMap<String, &str> = BTreeMap::new();
        for input in inputs {
            for (name, value) in input.exports.iter() {
                let key = env_key(&input.alias, name);
                if let Some(other) = injected.insert(key.clone(), &input.alias) {
                    return Err(SphereError::malformed(
                        &ctx.descriptor.location,
                        format!(
                            "exports of dependencies '{other}' and '{}' both map to {key}",
                            input.alias
                        ),
                    ));
                }
                env.insert(key, value.to_string());
            }
        }
        Ok(env)
    }
}

/// Writes the read-only `{alias: {name: value}}` snapshot of dependency exports.
fn write_inputs(path: &Path, inputs: &[DependencyInput]) -> std::io::Result<()> {
    let snapshot: serde_json::Map<String, serde_json::Value> = inputs
        .iter()
        .map(|input| {
            let values: serde_json::Map<String, serde_json::Value> = input
                .exports
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect();
            (input.alias.clone(), serde_json::Value::Object(values))
        })
        .collect();
    let content = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, content)?;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)
}

fn write_shims(bin: &Path, shims: &[Shim]) -> std::io::Result<()> {
    std::fs::create_dir_all(bin)?;
    for shim in shims {
        let path = bin.join(&shim.alias);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", shim.entrypoint))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}
