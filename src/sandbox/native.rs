//! bubblewrap backend.
//!
//! The process gets fresh namespaces (no network, no host PIDs), read-only
//! system directories plus a handful of `/etc` files, its sandbox root
//! read-write, and one bind mount per grant. The entrypoint audit still runs
//! first, so an out-of-grant access is reported as `PermissionDenied`
//! instead of an opaque runtime failure.
use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ExecutionContext, SandboxBackend};
use crate::capability::AccessMode;
use crate::error::SphereError;

/// Host directories every process needs to find a shell and libraries.
const SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64"];

/// The parts of `/etc` the loader, libc name lookups and `/usr/bin`
/// alternatives symlinks read. The rest of `/etc` needs a grant.
const SYSTEM_FILES: &[&str] = &[
    "/etc/ld.so.cache",
    "/etc/passwd",
    "/etc/group",
    "/etc/nsswitch.conf",
    "/etc/localtime",
    "/etc/alternatives",
];

pub struct NativeBackend {
    bwrap: PathBuf,
}

impl NativeBackend {
    pub fn new(bwrap: impl Into<PathBuf>) -> Self {
        Self {
            bwrap: bwrap.into(),
        }
    }

    /// Finds `bwrap` on PATH.
    pub fn locate() -> anyhow::Result<Self> {
        let bwrap = which::which("bwrap").map_err(|e| {
            anyhow!("native sandbox backend requires bubblewrap ('bwrap') on PATH: {e}")
        })?;
        debug!("Using bubblewrap at {}", bwrap.display());
        Ok(Self::new(bwrap))
    }

    /// Arguments passed to `bwrap`, ending with `-- <shell> -c <entrypoint>`.
    pub fn arguments(&self, shell: &str, ctx: &ExecutionContext) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--unshare-all",
            "--die-with-parent",
            "--new-session",
            "--proc",
            "/proc",
            "--dev",
            "/dev",
            "--tmpfs",
            "/tmp",
        ]
        .iter()
        .map(OsString::from)
        .collect();

        for &path in SYSTEM_DIRS.iter().chain(SYSTEM_FILES) {
            args.extend(["--ro-bind-try", path, path].map(OsString::from));
        }

        for grant in ctx.descriptor.grants.iter() {
            // A pattern is mounted at its literal prefix; the audit narrows it
            let path = grant.literal_prefix();
            let flag = match grant.mode {
                AccessMode::Write => "--bind-try",
                AccessMode::Read | AccessMode::Execute => "--ro-bind-try",
            };
            args.push(flag.into());
            args.push(path.clone().into_os_string());
            args.push(path.into_os_string());
        }

        let root = ctx.root().as_os_str().to_os_string();
        args.push("--bind".into());
        args.push(root.clone());
        args.push(root.clone());
        args.push("--chdir".into());
        args.push(root);

        args.push("--".into());
        args.push(shell.into());
        args.push("-c".into());
        args.push(ctx.descriptor.entrypoint.clone().into());
        args
    }
}

#[async_trait]
impl SandboxBackend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    async fn enforce(&self, ctx: &ExecutionContext) -> Result<(), SphereError> {
        ctx.audit()
    }

    fn command(&self, shell: &str, ctx: &ExecutionContext) -> Command {
        let mut cmd = Command::new(&self.bwrap);
        cmd.args(self.arguments(shell, ctx));
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::sandbox::SandboxConstructor;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn context(grants: &str) -> (tempfile::TempDir, ExecutionContext) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sphere");
        std::fs::write(&path, format!("entrypoint = \"echo hi\"\n{grants}")).unwrap();
        let d = Arc::new(crate::descriptor::load(&path, None).unwrap());
        let ctx = SandboxConstructor::with_host_env(SandboxConfig::default(), BTreeMap::new())
            .build(d, &[])
            .unwrap();
        (dir, ctx)
    }

    fn contains_window(args: &[OsString], window: &[&str]) -> bool {
        args.windows(window.len())
            .any(|w| w.iter().zip(window).all(|(a, b)| a == b))
    }

    #[test]
    fn test_arguments_isolate_and_bind_root() {
        let (_dir, ctx) = context("");
        let backend = NativeBackend::new("/usr/bin/bwrap");
        let args = backend.arguments("sh", &ctx);
        let root = ctx.root().to_string_lossy().into_owned();

        assert_eq!(args[0], "--unshare-all");
        assert!(contains_window(&args, &["--ro-bind-try", "/usr", "/usr"]));
        assert!(contains_window(&args, &["--bind", &root, &root]));
        // Only selected files from /etc are visible
        assert!(contains_window(&args, &["--ro-bind-try", "/etc/ld.so.cache", "/etc/ld.so.cache"]));
        assert!(!contains_window(&args, &["--ro-bind-try", "/etc", "/etc"]));
        assert!(contains_window(&args, &["--chdir", &root]));
        assert!(contains_window(&args, &["--", "sh", "-c", "echo hi"]));
    }

    #[test]
    fn test_grants_become_binds() {
        let (_dir, ctx) = context(
            "grants = [{ path = \"/data\", mode = \"read\" }, { path = \"/out/*.log\", mode = \"write\" }]\n",
        );
        let backend = NativeBackend::new("/usr/bin/bwrap");
        let args = backend.arguments("sh", &ctx);
        assert!(contains_window(&args, &["--ro-bind-try", "/data", "/data"]));
        assert!(contains_window(&args, &["--bind-try", "/out", "/out"]));
    }

    #[test]
    fn test_command_uses_bwrap_binary() {
        let (_dir, ctx) = context("");
        let backend = NativeBackend::new("/opt/bin/bwrap");
        let cmd = backend.command("sh", &ctx);
        assert_eq!(cmd.as_std().get_program(), "/opt/bin/bwrap");
        assert_eq!(backend.name(), "native");
    }
}
