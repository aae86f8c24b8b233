//! Sphere descriptors: the typed, validated form of a `.sphere` document.

pub mod index;
pub mod loader;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::capability::GrantSet;

pub use index::SphereIndex;
pub use loader::{from_document, load};

/// Environment variables a descriptor may never set.
const PROTECTED_ENV: &[&str] = &["PATH", "HOME", "TMPDIR", "SHELL", "USER", "IFS", "ENV", "BASH_ENV"];

/// Prefixes of environment variables a descriptor may never set.
const PROTECTED_ENV_PREFIXES: &[&str] = &["LD_", "DYLD_", "SPHERE_"];

/// A loaded sphere. Immutable once built by the loader.
#[derive(Debug, Clone, PartialEq)]
pub struct SphereDescriptor {
    /// Canonical absolute path of the descriptor file.
    pub location: PathBuf,
    pub id: Option<String>,
    pub description: Option<String>,
    /// Shell command run inside the sandbox. Never empty.
    pub entrypoint: String,
    /// In declaration order; this order breaks scheduling ties.
    pub dependencies: Vec<SphereReference>,
    pub grants: GrantSet,
    /// Names of the values this sphere exposes to its dependents.
    pub exports: Vec<String>,
    /// Additive environment entries.
    pub env: BTreeMap<String, String>,
    pub limits: Limits,
}

/// A resolved reference from one descriptor to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SphereReference {
    /// Namespace for the dependency's exports in the dependent's environment.
    pub alias: String,
    /// The reference as written (path or `id:` form), for diagnostics.
    pub declared: String,
    /// Canonical absolute path of the referenced descriptor.
    pub target: PathBuf,
}

/// Whether a limit violation is fatal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Best effort: a violation is logged and the process keeps running.
    Soft,
    /// A violation terminates the process and yields `ResourceExceeded`.
    #[default]
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Limit {
    pub value: u64,
    pub enforcement: Enforcement,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Limits {
    pub time_seconds: Option<Limit>,
    pub memory_bytes: Option<Limit>,
}

impl Limits {
    pub fn is_empty(&self) -> bool {
        self.time_seconds.is_none() && self.memory_bytes.is_none()
    }

    pub fn time(&self) -> Option<(Duration, Enforcement)> {
        self.time_seconds
            .map(|l| (Duration::from_secs(l.value), l.enforcement))
    }

    pub fn memory(&self) -> Option<(u64, Enforcement)> {
        self.memory_bytes.map(|l| (l.value, l.enforcement))
    }
}

impl SphereDescriptor {
    /// Short human name: the `id` if declared, otherwise the file stem.
    pub fn name(&self) -> String {
        if let Some(ref id) = self.id {
            return id.clone();
        }
        self.location
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.location.display().to_string())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether `key` names a host variable that descriptors must not override.
pub fn is_protected_env(key: &str) -> bool {
    PROTECTED_ENV.contains(&key) || PROTECTED_ENV_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Turns an arbitrary name (file stem, identifier) into an alias identifier.
pub fn sanitize_alias(name: &str) -> String {
    let mut alias: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if alias.is_empty() || alias.starts_with(|c: char| c.is_ascii_digit()) {
        alias.insert(0, '_');
    }
    alias
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("result"));
        assert!(is_identifier("_x9"));
        assert!(!is_identifier("9x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_protected_env() {
        assert!(is_protected_env("PATH"));
        assert!(is_protected_env("LD_PRELOAD"));
        assert!(is_protected_env("DYLD_INSERT_LIBRARIES"));
        assert!(is_protected_env("SPHERE_DEP_X_Y"));
        assert!(!is_protected_env("GREETING"));
    }

    #[test]
    fn test_sanitize_alias() {
        assert_eq!(sanitize_alias("hello-world"), "hello_world");
        assert_eq!(sanitize_alias("2fast"), "_2fast");
        assert_eq!(sanitize_alias(""), "_");
    }

    #[test]
    fn test_limits_accessors() {
        let limits = Limits {
            time_seconds: Some(Limit {
                value: 3,
                enforcement: Enforcement::Soft,
            }),
            memory_bytes: None,
        };
        assert_eq!(limits.time(), Some((Duration::from_secs(3), Enforcement::Soft)));
        assert!(limits.memory().is_none());
        assert!(!limits.is_empty());
        assert!(Limits::default().is_empty());
    }
}
