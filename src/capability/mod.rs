//! Filesystem capabilities: declared grants and default-deny enforcement.
//!
//! A node sees exactly its own grants. Nothing is inherited from the
//! nodes it depends on or from the nodes that depend on it.
//!
//! Grants are validated when the descriptor is loaded (`FilesystemGrant::parse`)
//! and enforced before the entrypoint is spawned (`CapabilityGuard`), using the
//! command audit in [`audit`].

pub mod audit;

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SphereError;

/// Device files every process may touch regardless of its grants.
const SANDBOX_DEVICES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/random",
    "/dev/urandom",
    "/dev/stdin",
    "/dev/stdout",
    "/dev/stderr",
    "/dev/tty",
];

/// Access mode of a grant, or of an attempted access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    Execute,
}

impl AccessMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(AccessMode::Read),
            "write" => Some(AccessMode::Write),
            "execute" => Some(AccessMode::Execute),
            _ => None,
        }
    }

    /// Whether a grant in this mode allows an access in `requested` mode.
    ///
    /// `write` and `execute` both imply `read`; nothing implies `write`.
    pub fn permits(self, requested: AccessMode) -> bool {
        self == requested || requested == AccessMode::Read
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Execute => "execute",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared filesystem capability: an absolute path (or glob pattern) and a mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FilesystemGrant {
    /// Absolute, normalized path or pattern.
    pub path: PathBuf,
    pub mode: AccessMode,
}

impl FilesystemGrant {
    /// Validates and normalizes a grant as written in the descriptor at `descriptor`.
    ///
    /// Relative paths are sphere-relative: they resolve against the
    /// descriptor's directory.
    pub fn parse(descriptor: &Path, raw_path: &str, raw_mode: &str) -> Result<Self, SphereError> {
        let mode = AccessMode::parse(raw_mode).ok_or_else(|| {
            SphereError::invalid_grant(
                descriptor,
                raw_path,
                format!("unknown mode '{raw_mode}' (expected read, write or execute)"),
            )
        })?;

        if raw_path.trim().is_empty() {
            return Err(SphereError::invalid_grant(descriptor, raw_path, "empty path"));
        }
        if raw_path.contains('\0') {
            return Err(SphereError::invalid_grant(descriptor, raw_path, "path contains a NUL byte"));
        }
        if raw_path.starts_with('~') {
            return Err(SphereError::invalid_grant(
                descriptor,
                raw_path,
                "home-relative paths are not allowed; use an absolute or sphere-relative path",
            ));
        }

        let declared = Path::new(raw_path);
        if declared.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(SphereError::invalid_grant(
                descriptor,
                raw_path,
                "'..' components are not allowed",
            ));
        }

        let absolute = if declared.is_absolute() {
            declared.to_path_buf()
        } else {
            let base = descriptor.parent().unwrap_or_else(|| Path::new("/"));
            base.join(declared)
        };

        let path = if is_pattern(raw_path) {
            let normalized = normalize_lexically(&absolute);
            glob::Pattern::new(&normalized.to_string_lossy()).map_err(|e| {
                SphereError::invalid_grant(descriptor, raw_path, format!("invalid pattern: {e}"))
            })?;
            normalized
        } else {
            canonicalize_lenient(&absolute)
        };

        Ok(Self { path, mode })
    }

    pub fn is_pattern(&self) -> bool {
        is_pattern(&self.path.to_string_lossy())
    }

    /// Whether this grant covers `target` (already canonical): the grant's
    /// path is `target` or one of its ancestors, or the pattern matches
    /// `target` or one of its ancestors.
    pub fn covers(&self, target: &Path) -> bool {
        if self.is_pattern() {
            let Ok(pattern) = glob::Pattern::new(&self.path.to_string_lossy()) else {
                return false;
            };
            target.ancestors().any(|a| pattern.matches_path(a))
        } else {
            target.starts_with(&self.path)
        }
    }

    /// The non-pattern prefix of the grant, used to detect overlap between grants.
    pub fn literal_prefix(&self) -> PathBuf {
        if !self.is_pattern() {
            return self.path.clone();
        }
        let mut prefix = PathBuf::new();
        for component in self.path.components() {
            if is_pattern(&component.as_os_str().to_string_lossy()) {
                break;
            }
            prefix.push(component);
        }
        prefix
    }
}

impl fmt::Display for FilesystemGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path.display(), self.mode)
    }
}

/// The grants declared by one descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GrantSet {
    grants: Vec<FilesystemGrant>,
}

impl GrantSet {
    pub fn new(mut grants: Vec<FilesystemGrant>) -> Self {
        grants.sort();
        grants.dedup();
        Self { grants }
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilesystemGrant> {
        self.grants.iter()
    }

    /// Whether any grant allows `mode` access to `target`.
    pub fn allows(&self, target: &Path, mode: AccessMode) -> bool {
        self.grants
            .iter()
            .any(|g| g.mode.permits(mode) && g.covers(target))
    }

    /// Whether two nodes' write grants touch the same part of the filesystem.
    pub fn write_overlaps(&self, other: &GrantSet) -> bool {
        let mine: Vec<PathBuf> = self.write_prefixes().collect();
        other.write_prefixes().any(|theirs| {
            mine.iter()
                .any(|m| m.starts_with(&theirs) || theirs.starts_with(m))
        })
    }

    fn write_prefixes(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.grants
            .iter()
            .filter(|g| g.mode == AccessMode::Write)
            .map(FilesystemGrant::literal_prefix)
    }
}

/// Enforces one node's grants against the accesses its entrypoint attempts.
///
/// The node's own sandbox root is always accessible; so are the standard
/// device files. Everything else must be covered by a grant.
pub struct CapabilityGuard<'a> {
    node: &'a Path,
    grants: &'a GrantSet,
    sandbox_root: &'a Path,
}

impl<'a> CapabilityGuard<'a> {
    pub fn new(node: &'a Path, grants: &'a GrantSet, sandbox_root: &'a Path) -> Self {
        Self {
            node,
            grants,
            sandbox_root,
        }
    }

    /// Checks a single access. Relative targets resolve against the sandbox root.
    pub fn check(&self, target: &Path, mode: AccessMode) -> Result<(), SphereError> {
        let absolute = if target.is_absolute() {
            target.to_path_buf()
        } else {
            self.sandbox_root.join(target)
        };
        let resolved = canonicalize_lenient(&absolute);

        if resolved.starts_with(self.sandbox_root) {
            return Ok(());
        }
        if is_sandbox_device(&resolved) {
            return Ok(());
        }
        if self.grants.allows(&resolved, mode) {
            debug!("{}: {mode} access to {} granted", self.node.display(), resolved.display());
            return Ok(());
        }

        Err(SphereError::PermissionDenied {
            node: self.node.to_path_buf(),
            target: resolved,
            mode: mode.to_string(),
        })
    }

    /// Checks every access found by the entrypoint audit, failing on the first denial.
    /// A target the audit could not resolve is denied whatever the grants say.
    pub fn check_all<'b>(
        &self,
        accesses: impl IntoIterator<Item = &'b audit::Access>,
    ) -> Result<(), SphereError> {
        for access in accesses {
            if let Some(reason) = access.unresolved {
                warn!("{}: {} access to `{}` denied: {reason}", self.node.display(), access.mode, access.path);
                return Err(SphereError::PermissionDenied {
                    node: self.node.to_path_buf(),
                    target: PathBuf::from(&access.path),
                    mode: access.mode.to_string(),
                });
            }
            self.check(Path::new(&access.path), access.mode)?;
        }
        Ok(())
    }
}

fn is_sandbox_device(path: &Path) -> bool {
    SANDBOX_DEVICES.iter().any(|d| path == Path::new(d)) || path.starts_with("/dev/fd") || path.starts_with("/proc/self/fd")
}

fn is_pattern(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root stays at the root, as the kernel does.
                if !out.pop() {
                    out.push(Component::RootDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Canonicalizes the longest existing prefix of `path` (resolving symlinks)
/// and appends the remaining components lexically.
pub fn canonicalize_lenient(path: &Path) -> PathBuf {
    let normalized = normalize_lexically(path);
    let mut existing = normalized.as_path();
    let mut rest: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name);
                existing = parent;
            }
            _ => return normalized,
        }
    }
}
