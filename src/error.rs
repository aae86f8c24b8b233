use std::fmt;
use std::path::{Path, PathBuf};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Errors surfaced by the resolution-and-execution engine.
///
/// Every variant names the canonical descriptor path (or reference) that
/// produced it. None of them is retried: failures are reported once and
/// propagate through the graph as `DependencyFailed`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SphereError {
    /// The descriptor document has a missing/empty entrypoint or a field of the wrong shape.
    #[error("malformed descriptor {}: {reason}", .path.display())]
    MalformedDescriptor { path: PathBuf, reason: String },

    /// A dependency reference (path or identifier) could not be located.
    #[error("unresolved reference '{reference}'{}: {reason}", from_suffix(.from))]
    UnresolvedReference {
        reference: String,
        from: Option<PathBuf>,
        reason: String,
    },

    /// The dependency graph contains a cycle. `cycle` starts and ends on the same node.
    #[error("cyclic dependency: {}", display_cycle(.cycle))]
    CyclicDependency { cycle: Vec<PathBuf> },

    /// A declared filesystem grant is not well-formed.
    #[error("invalid grant '{grant}' in {}: {reason}", .path.display())]
    InvalidGrant {
        path: PathBuf,
        grant: String,
        reason: String,
    },

    /// The entrypoint attempted an access outside the node's own grants.
    #[error("permission denied for {}: {mode} access to {}", .node.display(), .target.display())]
    PermissionDenied {
        node: PathBuf,
        target: PathBuf,
        mode: String,
    },

    /// A dependency of the node ended in a non-successful state; the node never ran.
    #[error("dependency {} failed", .failed.display())]
    DependencyFailed { node: PathBuf, failed: PathBuf },

    /// A hard resource limit was exceeded and the process was terminated.
    #[error("{} exceeded hard {limit} limit ({detail})", .node.display())]
    ResourceExceeded {
        node: PathBuf,
        limit: String,
        detail: String,
    },

    /// The entrypoint could not be spawned (missing interpreter or binary).
    #[error("execution error in {}: {reason}", .node.display())]
    ExecutionError { node: PathBuf, reason: String },

    /// The entrypoint ran and exited with a non-zero status.
    #[error("{} exited with status {}", .node.display(), display_code(.code))]
    NonZeroExit { node: PathBuf, code: Option<i32> },

    /// The node was cancelled before starting because another node failed
    /// and cancel-on-first-failure is enabled.
    #[error("{} cancelled after {} failed", .node.display(), .trigger.display())]
    Cancelled { node: PathBuf, trigger: PathBuf },
}

/// Fieldless classification of a [`SphereError`], used for exit codes and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedDescriptor,
    UnresolvedReference,
    CyclicDependency,
    InvalidGrant,
    PermissionDenied,
    DependencyFailed,
    ResourceExceeded,
    ExecutionError,
    NonZeroExit,
    Cancelled,
}

impl ErrorKind {
    /// Process exit code reserved for this failure category.
    ///
    /// These values are part of the command-line contract and must not change.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::MalformedDescriptor => 65,
            ErrorKind::InvalidGrant => 66,
            ErrorKind::CyclicDependency => 67,
            ErrorKind::DependencyFailed => 68,
            ErrorKind::ResourceExceeded => 69,
            ErrorKind::ExecutionError => 70,
            ErrorKind::Cancelled => 71,
            ErrorKind::UnresolvedReference => 72,
            ErrorKind::NonZeroExit => 1,
            ErrorKind::PermissionDenied => 77,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MalformedDescriptor => "MalformedDescriptor",
            ErrorKind::UnresolvedReference => "UnresolvedReference",
            ErrorKind::CyclicDependency => "CyclicDependency",
            ErrorKind::InvalidGrant => "InvalidGrant",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::DependencyFailed => "DependencyFailed",
            ErrorKind::ResourceExceeded => "ResourceExceeded",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::NonZeroExit => "NonZeroExit",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl SphereError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SphereError::MalformedDescriptor { .. } => ErrorKind::MalformedDescriptor,
            SphereError::UnresolvedReference { .. } => ErrorKind::UnresolvedReference,
            SphereError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            SphereError::InvalidGrant { .. } => ErrorKind::InvalidGrant,
            SphereError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            SphereError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            SphereError::ResourceExceeded { .. } => ErrorKind::ResourceExceeded,
            SphereError::ExecutionError { .. } => ErrorKind::ExecutionError,
            SphereError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            SphereError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Shorthand for the most common load-time failure.
    pub fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        SphereError::MalformedDescriptor {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn invalid_grant(path: &Path, grant: &str, reason: impl Into<String>) -> Self {
        SphereError::InvalidGrant {
            path: path.to_path_buf(),
            grant: grant.to_string(),
            reason: reason.into(),
        }
    }
}

impl Serialize for SphereError {
    /// Serialized as `{"kind": ..., "message": ...}` in reports.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SphereError", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

fn from_suffix(from: &Option<PathBuf>) -> String {
    match from {
        Some(p) => format!(" (referenced from {})", p.display()),
        None => String::new(),
    }
}

fn display_cycle(cycle: &[PathBuf]) -> String {
    cycle
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "none (killed by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let kinds = [
            ErrorKind::MalformedDescriptor,
            ErrorKind::UnresolvedReference,
            ErrorKind::CyclicDependency,
            ErrorKind::InvalidGrant,
            ErrorKind::PermissionDenied,
            ErrorKind::DependencyFailed,
            ErrorKind::ResourceExceeded,
            ErrorKind::ExecutionError,
            ErrorKind::NonZeroExit,
            ErrorKind::Cancelled,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_cycle_display_names_every_node() {
        let err = SphereError::CyclicDependency {
            cycle: vec![
                PathBuf::from("/s/a.sphere"),
                PathBuf::from("/s/b.sphere"),
                PathBuf::from("/s/a.sphere"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency: /s/a.sphere -> /s/b.sphere -> /s/a.sphere"
        );
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
    }

    #[test]
    fn test_dependency_failed_names_failing_node() {
        let err = SphereError::DependencyFailed {
            node: PathBuf::from("/s/a.sphere"),
            failed: PathBuf::from("/s/b.sphere"),
        };
        assert!(err.to_string().contains("/s/b.sphere"));
    }

    #[test]
    fn test_serializes_kind_and_message() {
        let err = SphereError::NonZeroExit {
            node: PathBuf::from("/s/b.sphere"),
            code: Some(2),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "non_zero_exit");
        assert_eq!(json["message"], "/s/b.sphere exited with status 2");
    }

    #[test]
    fn test_unresolved_reference_mentions_origin() {
        let err = SphereError::UnresolvedReference {
            reference: "missing.sphere".to_string(),
            from: Some(PathBuf::from("/s/a.sphere")),
            reason: "not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unresolved reference 'missing.sphere' (referenced from /s/a.sphere): not found"
        );
    }
}
