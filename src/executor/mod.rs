//! Process executor: runs one prepared sandbox and classifies the outcome.
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use sysinfo::{Pid, System};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::descriptor::Enforcement;
use crate::error::SphereError;
use crate::exports::{parse_exports, Exports};
use crate::sandbox::{ExecutionContext, SandboxBackend};

/// How long output readers may keep draining once the process is gone.
/// A backgrounded grandchild can hold the pipes open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Shell statuses meaning "not executable" and "not found".
const SPAWN_FAILURE_CODES: &[i32] = &[126, 127];

/// Terminal classification of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
    ExecutionError,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Succeeded
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed out",
            Outcome::ExecutionError => "execution error",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Canonical descriptor path.
    pub node: PathBuf,
    pub outcome: Outcome,
    /// `None` when the process never ran or was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Declared exports, only ever non-empty on success.
    pub exports: Exports,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub error: Option<SphereError>,
}

impl ExecutionResult {
    /// A node whose entrypoint never started (short-circuit, cancellation,
    /// denied access).
    pub fn not_run(node: PathBuf, error: SphereError) -> Self {
        Self {
            node,
            outcome: Outcome::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            exports: Exports::new(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            error: Some(error),
        }
    }

    /// A node whose process could not be started or supervised.
    pub fn errored(node: PathBuf, reason: impl Into<String>) -> Self {
        let error = SphereError::ExecutionError {
            node: node.clone(),
            reason: reason.into(),
        };
        Self {
            outcome: Outcome::ExecutionError,
            ..Self::not_run(node, error)
        }
    }

    /// Whether the entrypoint was actually started.
    pub fn ran(&self) -> bool {
        !matches!(
            self.error,
            Some(SphereError::DependencyFailed { .. })
                | Some(SphereError::Cancelled { .. })
                | Some(SphereError::PermissionDenied { .. })
        ) && !(self.outcome == Outcome::ExecutionError && self.exit_code.is_none())
    }
}

pub(crate) fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// How the supervised process ended.
enum Termination {
    Exited(ExitStatus),
    TimedOut(Duration),
    MemoryExceeded { used: u64, limit: u64 },
    WaitFailed(std::io::Error),
}

pub struct ProcessExecutor {
    backend: Arc<dyn SandboxBackend>,
    shell: String,
    memory_sample: Duration,
}

impl ProcessExecutor {
    pub fn new(backend: Arc<dyn SandboxBackend>, shell: impl Into<String>, memory_sample: Duration) -> Self {
        Self {
            backend,
            shell: shell.into(),
            memory_sample: memory_sample.max(Duration::from_millis(1)),
        }
    }

    pub fn backend(&self) -> &dyn SandboxBackend {
        self.backend.as_ref()
    }

    /// Runs the node's entrypoint in `ctx`. Never fails: every failure is
    /// folded into the returned result.
    pub async fn execute(&self, ctx: &ExecutionContext) -> ExecutionResult {
        let name = ctx.descriptor.name();
        let node = ctx.node().to_path_buf();
        let started_at = Utc::now();
        let clock = Instant::now();

        if let Err(e) = self.backend.enforce(ctx).await {
            warn!("{name}: {e}");
            let mut result = match e {
                SphereError::ExecutionError { reason, .. } => ExecutionResult::errored(node, reason),
                other => ExecutionResult::not_run(node, other),
            };
            result.started_at = started_at;
            return result;
        }

        let mut cmd = self.backend.command(&self.shell, ctx);
        cmd.env_clear()
            .envs(&ctx.env)
            .current_dir(ctx.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so limits reach everything the entrypoint starts
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("{name}: failed to spawn '{}': {e}", self.shell);
                let mut result =
                    ExecutionResult::errored(node, format!("failed to spawn '{}': {e}", self.shell));
                result.started_at = started_at;
                return result;
            }
        };
        info!(
            "Running {name} via {} backend (pid {})",
            self.backend.name(),
            child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );

        let group = child.id();
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let termination = self.supervise(&mut child, ctx).await;
        // Leftover background jobs must not outlive the node
        kill_group(group, &name);
        let (stdout, stderr) =
            futures::future::join(collect(stdout, &name), collect(stderr, &name)).await;

        let mut result = ExecutionResult {
            node: node.clone(),
            outcome: Outcome::Succeeded,
            exit_code: None,
            stdout,
            stderr,
            exports: Exports::new(),
            started_at,
            duration: clock.elapsed(),
            error: None,
        };

        match termination {
            Termination::Exited(status) => match status.code() {
                Some(0) => {
                    result.exit_code = Some(0);
                    result.exports = read_exports(ctx).await;
                }
                Some(code) if SPAWN_FAILURE_CODES.contains(&code) => {
                    result.outcome = Outcome::ExecutionError;
                    result.exit_code = Some(code);
                    let detail = result
                        .stderr
                        .lines()
                        .rev()
                        .find(|l| !l.trim().is_empty())
                        .unwrap_or(if code == 127 { "command not found" } else { "not executable" })
                        .to_string();
                    result.error = Some(SphereError::ExecutionError {
                        node,
                        reason: format!("entrypoint could not be executed (status {code}): {detail}"),
                    });
                }
                code => {
                    result.outcome = Outcome::Failed;
                    result.exit_code = code;
                    result.error = Some(SphereError::NonZeroExit { node, code });
                }
            },
            Termination::TimedOut(limit) => {
                result.outcome = Outcome::TimedOut;
                result.error = Some(SphereError::ResourceExceeded {
                    node,
                    limit: "time".to_string(),
                    detail: format!("still running after {}s", limit.as_secs()),
                });
            }
            Termination::MemoryExceeded { used, limit } => {
                result.outcome = Outcome::Failed;
                result.error = Some(SphereError::ResourceExceeded {
                    node,
                    limit: "memory".to_string(),
                    detail: format!("{used} bytes in use, limit is {limit} bytes"),
                });
            }
            Termination::WaitFailed(e) => {
                result.outcome = Outcome::ExecutionError;
                result.error = Some(SphereError::ExecutionError {
                    node,
                    reason: format!("failed to wait for process: {e}"),
                });
            }
        }

        info!(
            "{name} {} in {:.2}s{}",
            result.outcome,
            result.duration.as_secs_f64(),
            result
                .exit_code
                .map(|c| format!(" (exit {c})"))
                .unwrap_or_default()
        );
        result
    }

    /// Waits for the child while enforcing time and memory limits.
    async fn supervise(&self, child: &mut Child, ctx: &ExecutionContext) -> Termination {
        let name = ctx.descriptor.name();
        let time = ctx.descriptor.limits.time();
        let memory = ctx.descriptor.limits.memory();
        let pid = child.id();

        let deadline = tokio::time::sleep(time.map(|(d, _)| d).unwrap_or_default());
        tokio::pin!(deadline);
        let mut time_armed = time.is_some();

        let mut sampler = tokio::time::interval(self.memory_sample);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut system = System::new();
        let mut memory_armed = memory.is_some() && pid.is_some();

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => Termination::Exited(status),
                        Err(e) => Termination::WaitFailed(e),
                    };
                }
                _ = &mut deadline, if time_armed => {
                    time_armed = false;
                    let Some((limit, enforcement)) = time else { continue };
                    match enforcement {
                        Enforcement::Hard => {
                            warn!("{name} exceeded its {}s time limit, killing", limit.as_secs());
                            kill(child, &name).await;
                            return Termination::TimedOut(limit);
                        }
                        Enforcement::Soft => {
                            warn!("{name} exceeded its soft {}s time limit, letting it run", limit.as_secs());
                        }
                    }
                }
                _ = sampler.tick(), if memory_armed => {
                    let (Some(pid), Some((limit, enforcement))) = (pid, memory) else {
                        memory_armed = false;
                        continue;
                    };
                    let used = tree_memory(&mut system, pid);
                    if used <= limit {
                        continue;
                    }
                    match enforcement {
                        Enforcement::Hard => {
                            warn!("{name} uses {used} bytes (limit {limit}), killing");
                            kill(child, &name).await;
                            return Termination::MemoryExceeded { used, limit };
                        }
                        Enforcement::Soft => {
                            warn!("{name} uses {used} bytes, over its soft limit of {limit}");
                            memory_armed = false;
                        }
                    }
                }
            }
        }
    }
}

async fn kill(child: &mut Child, name: &str) {
    kill_group(child.id(), name);
    if let Err(e) = child.kill().await {
        warn!("Failed to kill {name}: {e}");
    }
}

/// Sends SIGKILL to the process group led by `leader`.
#[cfg(unix)]
fn kill_group(leader: Option<u32>, name: &str) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};

    let Some(leader) = leader.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(nix::unistd::Pid::from_raw(leader), Signal::SIGKILL) {
        Ok(()) => debug!("Killed process group {leader} of {name}"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group of {name}: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_group(_leader: Option<u32>, _name: &str) {}

/// Resident memory of `root` and all of its descendants.
fn tree_memory(system: &mut System, root: u32) -> u64 {
    system.refresh_processes();
    let root = Pid::from_u32(root);
    let processes = system.processes();
    processes
        .values()
        .filter(|p| {
            let mut current = p.pid();
            // Bounded walk up the parent chain
            for _ in 0..64 {
                if current == root {
                    return true;
                }
                match processes.get(&current).and_then(|p| p.parent()) {
                    Some(parent) => current = parent,
                    None => return false,
                }
            }
            false
        })
        .map(|p| p.memory())
        .sum()
}

fn spawn_reader<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("Output pipe closed with error: {e}");
        }
        buf
    })
}

async fn collect(reader: Option<JoinHandle<Vec<u8>>>, name: &str) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
        Ok(Err(e)) => {
            warn!("{name}: output reader failed: {e}");
            String::new()
        }
        Err(_) => {
            warn!("{name}: output still held open by a background process, dropping it");
            handle.abort();
            String::new()
        }
    }
}

async fn read_exports(ctx: &ExecutionContext) -> Exports {
    let declared = &ctx.descriptor.exports;
    match tokio::fs::read_to_string(ctx.exports_path()).await {
        Ok(content) => parse_exports(&content, declared),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => parse_exports("", declared),
        Err(e) => {
            warn!("{}: failed to read exports: {e}", ctx.descriptor.name());
            Exports::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::exports::ExportValue;
    use crate::sandbox::{PortableBackend, SandboxConstructor};
    use std::collections::BTreeMap;
    use std::path::Path;

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(Arc::new(PortableBackend), "sh", Duration::from_millis(20))
    }

    fn context(dir: &Path, document: &str) -> ExecutionContext {
        let path = dir.join("node.sphere");
        std::fs::write(&path, document).unwrap();
        let descriptor = Arc::new(crate::descriptor::load(&path, None).unwrap());
        let host = BTreeMap::from([(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        )]);
        SandboxConstructor::with_host_env(SandboxConfig::default(), host)
            .build(descriptor, &[])
            .unwrap()
    }

    // ── Outcomes ──────────────────────────────────────────

    #[tokio::test]
    async fn test_echo_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "entrypoint = \"echo hi\"\n");
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hi\n");
        assert!(result.error.is_none());
        assert!(result.ran());
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "entrypoint = \"echo oops >&2; exit 2\"\n");
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.stderr, "oops\n");
        assert!(matches!(
            result.error,
            Some(SphereError::NonZeroExit { code: Some(2), .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "entrypoint = \"sphere-no-such-program-xyz\"\n");
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::ExecutionError);
        assert_eq!(result.exit_code, Some(127));
        assert!(matches!(result.error, Some(SphereError::ExecutionError { .. })));
    }

    #[tokio::test]
    async fn test_missing_shell_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "entrypoint = \"echo hi\"\n");
        let executor = ProcessExecutor::new(
            Arc::new(PortableBackend),
            "/nonexistent/shell",
            Duration::from_millis(20),
        );
        let result = executor.execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::ExecutionError);
        assert_eq!(result.exit_code, None);
        assert!(!result.ran());
    }

    #[tokio::test]
    async fn test_runs_in_sandbox_root() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "entrypoint = \"pwd; echo $HOME\"\n");
        let result = executor().execute(&ctx).await;
        let root = ctx.root().to_string_lossy().into_owned();
        assert_eq!(result.stdout, format!("{root}\n{root}\n"));
    }

    #[tokio::test]
    async fn test_descriptor_env_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            "entrypoint = \"echo $GREETING\"\n[env]\nGREETING = \"bonjour\"\n",
        );
        let result = executor().execute(&ctx).await;
        assert_eq!(result.stdout, "bonjour\n");
    }

    // ── Capabilities ──────────────────────────────────────

    #[tokio::test]
    async fn test_access_without_grant_is_denied_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let ctx = context(
            dir.path(),
            &format!(
                "entrypoint = \"touch {} ; cat /etc/hostname\"\n",
                marker.display()
            ),
        );
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(matches!(result.error, Some(SphereError::PermissionDenied { .. })));
        assert!(!marker.exists());
        assert!(!result.ran());
    }

    // ── Limits ────────────────────────────────────────────

    #[tokio::test]
    async fn test_hard_time_limit_kills() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "entrypoint = \"sleep 5\"\n[limits]\ntime_seconds = 1\n");
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert!(matches!(
            result.error,
            Some(SphereError::ResourceExceeded { ref limit, .. }) if limit == "time"
        ));
        assert!(result.duration < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hard_time_limit_kills_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let out = std::fs::canonicalize(out.path()).unwrap();
        let ctx = context(
            dir.path(),
            &format!(
                "entrypoint = \"(sleep 2; touch {0}/late); true\"\ngrants = [{{ path = \"{0}\", mode = \"write\" }}]\n[limits]\ntime_seconds = 1\n",
                out.display()
            ),
        );
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::TimedOut);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!out.join("late").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_jobs_do_not_outlive_node() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let out = std::fs::canonicalize(out.path()).unwrap();
        let ctx = context(
            dir.path(),
            &format!(
                "entrypoint = \"(sleep 1; touch {0}/late) > /dev/null 2>&1 & echo started\"\ngrants = [{{ path = \"{0}\", mode = \"write\" }}]\n",
                out.display()
            ),
        );
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.stdout, "started\n");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!out.join("late").exists());
    }

    #[tokio::test]
    async fn test_soft_time_limit_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            "entrypoint = \"sleep 2; echo done\"\n[limits]\ntime_seconds = { value = 1, enforcement = \"soft\" }\n",
        );
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.stdout, "done\n");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_hard_memory_limit_kills() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "entrypoint = \"sleep 5\"\n[limits]\nmemory_bytes = 1\n");
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(matches!(
            result.error,
            Some(SphereError::ResourceExceeded { ref limit, .. }) if limit == "memory"
        ));
    }

    // ── Exports ───────────────────────────────────────────

    #[tokio::test]
    async fn test_declared_exports_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            "entrypoint = \"echo version=v1 >> $SPHERE_EXPORTS; echo hidden=x >> $SPHERE_EXPORTS\"\nexports = [\"version\"]\n",
        );
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.exports.len(), 1);
        assert_eq!(
            result.exports.get("version"),
            Some(&ExportValue::String("v1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_failed_node_exports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            "entrypoint = \"echo version=v1 >> $SPHERE_EXPORTS; exit 1\"\nexports = [\"version\"]\n",
        );
        let result = executor().execute(&ctx).await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.exports.is_empty());
    }

    #[test]
    fn test_result_serializes_duration_in_millis() {
        let mut result = ExecutionResult::not_run(
            PathBuf::from("/s/a.sphere"),
            SphereError::Cancelled {
                node: PathBuf::from("/s/a.sphere"),
                trigger: PathBuf::from("/s/b.sphere"),
            },
        );
        result.duration = Duration::from_millis(1500);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["error"]["kind"], "cancelled");
    }
}
