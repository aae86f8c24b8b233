use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Engine configuration. Every section and key is optional.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Size of the worker pool (concurrently running nodes)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Cancel every not-yet-started node as soon as one node fails
    #[serde(default)]
    pub cancel_on_first_failure: bool,
    /// Interpreter used as `<shell> -c <entrypoint>`
    #[serde(default = "default_shell")]
    pub shell: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Portable,
    /// bubblewrap, requires `bwrap` on PATH
    Native,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Where per-node sandbox roots are created (default: system temp dir)
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
    /// Host variables passed through to every entrypoint
    #[serde(default = "default_inherit_env")]
    pub inherit_env: Vec<String>,
    /// Write `<root>/bin/<alias>` scripts for direct dependencies
    #[serde(default)]
    pub dependency_shims: bool,
    #[serde(default = "default_memory_sample_ms")]
    pub memory_sample_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Directory holding installed descriptors and `index.json`.
    /// Supports `~` and ${ENV_VAR}
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_inherit_env() -> Vec<String> {
    ["PATH", "LANG", "LC_ALL", "TERM", "TZ", "USER"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_memory_sample_ms() -> u64 {
    100
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(shellexpand::tilde("~/.sphere/cache").into_owned())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            cancel_on_first_failure: false,
            shell: default_shell(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            root_dir: None,
            inherit_env: default_inherit_env(),
            dependency_shims: false,
            memory_sample_ms: default_memory_sample_ms(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${SPHERE_CACHE}
        let expanded = shellexpand::env(&content)?;
        Self::parse(&expanded)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.registry.cache_dir = expand_tilde(&config.registry.cache_dir);
        if let Some(ref root) = config.sandbox.root_dir {
            config.sandbox.root_dir = Some(expand_tilde(root));
        }
        if config.engine.workers == 0 {
            anyhow::bail!("engine.workers must be at least 1");
        }
        if config.engine.shell.trim().is_empty() {
            anyhow::bail!("engine.shell must not be empty");
        }
        Ok(config)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.engine.workers >= 1);
        assert!(!config.engine.cancel_on_first_failure);
        assert_eq!(config.engine.shell, "sh");
        assert_eq!(config.sandbox.backend, BackendKind::Portable);
        assert!(config.sandbox.root_dir.is_none());
        assert!(config.sandbox.inherit_env.contains(&"PATH".to_string()));
        assert_eq!(config.sandbox.memory_sample_ms, 100);
        assert!(config.registry.cache_dir.ends_with(".sphere/cache"));
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[engine]
workers = 3
cancel_on_first_failure = true
shell = "bash"

[sandbox]
backend = "native"
root_dir = "/var/tmp/sphere"
inherit_env = ["PATH"]
dependency_shims = true
memory_sample_ms = 250

[registry]
cache_dir = "/opt/spheres"
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.engine.workers, 3);
        assert!(config.engine.cancel_on_first_failure);
        assert_eq!(config.engine.shell, "bash");
        assert_eq!(config.sandbox.backend, BackendKind::Native);
        assert_eq!(config.sandbox.root_dir, Some(PathBuf::from("/var/tmp/sphere")));
        assert_eq!(config.sandbox.inherit_env, vec!["PATH".to_string()]);
        assert!(config.sandbox.dependency_shims);
        assert_eq!(config.sandbox.memory_sample_ms, 250);
        assert_eq!(config.registry.cache_dir, PathBuf::from("/opt/spheres"));
    }

    #[test]
    fn test_tilde_is_expanded() {
        let config = Config::parse("[registry]\ncache_dir = \"~/spheres\"\n").unwrap();
        assert!(!config.registry.cache_dir.starts_with("~"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::parse("[engine]\nworkers = 0\n").is_err());
        assert!(Config::parse("[engine]\nshell = \"\"\n").is_err());
        assert!(Config::parse("[sandbox]\nbackend = \"docker\"\n").is_err());
        assert!(Config::parse("[engine]\nunknown = 1\n").is_err());
    }

    #[test]
    fn test_load_expands_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sphere.toml");
        std::fs::write(&path, "[registry]\ncache_dir = \"${HOME}/cache\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert!(!config.registry.cache_dir.to_string_lossy().contains("${HOME}"));
    }
}
