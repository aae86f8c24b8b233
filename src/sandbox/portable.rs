use async_trait::async_trait;
use tokio::process::Command;

use super::{ExecutionContext, SandboxBackend};
use crate::error::SphereError;

/// Baseline backend available everywhere `sh` is.
///
/// Confinement comes entirely from the entrypoint audit: the command runs
/// directly, in its own sandbox root, with only the merged environment.
pub struct PortableBackend;

#[async_trait]
impl SandboxBackend for PortableBackend {
    fn name(&self) -> &str {
        "portable"
    }

    async fn enforce(&self, ctx: &ExecutionContext) -> Result<(), SphereError> {
        ctx.audit()
    }

    fn command(&self, shell: &str, ctx: &ExecutionContext) -> Command {
        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(&ctx.descriptor.entrypoint);
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

    #[tokio::test]
    async fn test_command_runs_shell() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sphere");
        std::fs::write(&path, "entrypoint = \"echo hi\"\n").unwrap();
        let d = Arc::new(crate::descriptor::load(&path, None).unwrap());
        let ctx = SandboxConstructor::with_host_env(SandboxConfig::default(), BTreeMap::new())
            .build(d, &[])
            .unwrap();

        let backend = PortableBackend;
        assert!(backend.enforce(&ctx).await.is_ok());
        let cmd = backend.command("sh", &ctx);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "sh");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["-c", "echo hi"]);
    }
}
