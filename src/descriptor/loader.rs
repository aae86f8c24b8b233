//! Descriptor loading: raw TOML document to validated `SphereDescriptor`.
//!
//! Dependency references are resolved here, once, to canonical absolute
//! paths. Nothing downstream re-resolves a relative path.
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::{
    is_identifier, is_protected_env, sanitize_alias, Enforcement, Limit, Limits,
    SphereDescriptor, SphereIndex, SphereReference,
};
use crate::capability::{audit, FilesystemGrant, GrantSet};
use crate::error::SphereError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDescriptor {
    id: Option<String>,
    description: Option<String>,
    entrypoint: Option<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    #[serde(default)]
    grants: Vec<RawGrant>,
    #[serde(default)]
    exports: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    limits: Option<RawLimits>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Path(String),
    Table(RawDependencyTable),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDependencyTable {
    path: Option<String>,
    id: Option<String>,
    alias: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGrant {
    path: String,
    mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimits {
    time_seconds: Option<RawLimit>,
    memory_bytes: Option<RawLimit>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLimit {
    Plain(i64),
    Tagged {
        value: i64,
        #[serde(default)]
        enforcement: Option<String>,
    },
}

/// Reads and validates the descriptor at `path`.
///
/// `path` should already be canonical; it becomes the descriptor's identity.
pub fn load(path: &Path, index: Option<&SphereIndex>) -> Result<SphereDescriptor, SphereError> {
    let content = std::fs::read_to_string(path).map_err(|e| SphereError::UnresolvedReference {
        reference: path.display().to_string(),
        from: None,
        reason: format!("cannot read descriptor: {e}"),
    })?;
    let document: toml::Table = content
        .parse()
        .map_err(|e: toml::de::Error| SphereError::malformed(path, e.message()))?;
    from_document(document, path, index)
}

/// Builds a descriptor from an already-parsed document located at `location`.
pub fn from_document(
    document: toml::Table,
    location: &Path,
    index: Option<&SphereIndex>,
) -> Result<SphereDescriptor, SphereError> {
    let raw: RawDescriptor = toml::Value::Table(document)
        .try_into()
        .map_err(|e: toml::de::Error| SphereError::malformed(location, e.message()))?;

    let entrypoint = match raw.entrypoint {
        Some(ref e) if !e.trim().is_empty() => e.clone(),
        Some(_) => return Err(SphereError::malformed(location, "'entrypoint' is empty")),
        None => {
            return Err(SphereError::malformed(
                location,
                "missing required field 'entrypoint'",
            ))
        }
    };
    audit::validate(&entrypoint).map_err(|e| {
        SphereError::malformed(location, format!("entrypoint is not a valid shell command: {e}"))
    })?;

    let exports = validate_exports(location, raw.exports)?;
    validate_env(location, &raw.env)?;
    let limits = convert_limits(location, raw.limits)?;

    let grants = raw
        .grants
        .iter()
        .map(|g| FilesystemGrant::parse(location, &g.path, &g.mode))
        .collect::<Result<Vec<_>, _>>()?;

    let dependencies = resolve_dependencies(location, raw.dependencies, index)?;

    debug!(
        "Loaded {} ({} dependencies, {} grants, {} exports)",
        location.display(),
        dependencies.len(),
        grants.len(),
        exports.len()
    );

    Ok(SphereDescriptor {
        location: location.to_path_buf(),
        id: raw.id,
        description: raw.description,
        entrypoint,
        dependencies,
        grants: GrantSet::new(grants),
        exports,
        env: raw.env,
        limits,
    })
}

fn validate_exports(location: &Path, exports: Vec<String>) -> Result<Vec<String>, SphereError> {
    let mut seen = HashSet::new();
    for name in &exports {
        if !is_identifier(name) {
            return Err(SphereError::malformed(
                location,
                format!("export name '{name}' is not an identifier"),
            ));
        }
        if !seen.insert(name.as_str()) {
            return Err(SphereError::malformed(
                location,
                format!("export '{name}' is declared twice"),
            ));
        }
    }
    Ok(exports)
}

fn validate_env(location: &Path, env: &BTreeMap<String, String>) -> Result<(), SphereError> {
    for key in env.keys() {
        if !is_identifier(key) {
            return Err(SphereError::malformed(
                location,
                format!("env key '{key}' is not an identifier"),
            ));
        }
        if is_protected_env(key) {
            return Err(SphereError::malformed(
                location,
                format!("env entry '{key}' would override a protected host variable"),
            ));
        }
    }
    Ok(())
}

fn convert_limits(location: &Path, raw: Option<RawLimits>) -> Result<Limits, SphereError> {
    let Some(raw) = raw else {
        return Ok(Limits::default());
    };
    let convert = |name: &str, limit: Option<RawLimit>| -> Result<Option<Limit>, SphereError> {
        let Some(limit) = limit else {
            return Ok(None);
        };
        let (value, enforcement) = match limit {
            RawLimit::Plain(v) => (v, None),
            RawLimit::Tagged { value, enforcement } => (value, enforcement),
        };
        if value <= 0 {
            return Err(SphereError::malformed(
                location,
                format!("limit '{name}' must be a positive integer (got {value})"),
            ));
        }
        let enforcement = match enforcement.as_deref() {
            None | Some("hard") => Enforcement::Hard,
            Some("soft") => Enforcement::Soft,
            Some(other) => {
                return Err(SphereError::malformed(
                    location,
                    format!("limit '{name}' has unknown enforcement '{other}' (expected soft or hard)"),
                ))
            }
        };
        Ok(Some(Limit {
            value: value as u64,
            enforcement,
        }))
    };

    Ok(Limits {
        time_seconds: convert("time_seconds", raw.time_seconds)?,
        memory_bytes: convert("memory_bytes", raw.memory_bytes)?,
    })
}

fn resolve_dependencies(
    location: &Path,
    raw: Vec<RawDependency>,
    index: Option<&SphereIndex>,
) -> Result<Vec<SphereReference>, SphereError> {
    let base = location.parent().unwrap_or_else(|| Path::new("/"));
    let mut aliases = HashSet::new();
    let mut targets = HashSet::new();
    let mut resolved = Vec::with_capacity(raw.len());

    for dependency in raw {
        let (path, id, alias) = match dependency {
            RawDependency::Path(p) => (Some(p), None, None),
            RawDependency::Table(t) => (t.path, t.id, t.alias),
        };

        if let Some(ref alias) = alias {
            if !is_identifier(alias) {
                return Err(SphereError::malformed(
                    location,
                    format!("dependency alias '{alias}' is not an identifier"),
                ));
            }
        }

        let reference = match (path, id) {
            (Some(path), None) => {
                if path.trim().is_empty() {
                    return Err(SphereError::malformed(location, "dependency path is empty"));
                }
                let target = resolve_path(base, &path).map_err(|e| {
                    SphereError::UnresolvedReference {
                        reference: path.clone(),
                        from: Some(location.to_path_buf()),
                        reason: e,
                    }
                })?;
                let alias = alias.unwrap_or_else(|| {
                    let stem = Path::new(&path)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    sanitize_alias(&stem)
                });
                SphereReference {
                    alias,
                    declared: path,
                    target,
                }
            }
            (None, Some(id)) => {
                let alias = alias.unwrap_or_else(|| sanitize_alias(&id));
                let index = index.ok_or_else(|| SphereError::UnresolvedReference {
                    reference: format!("id:{id}"),
                    from: Some(location.to_path_buf()),
                    reason: "no cache index is configured for identifier references".to_string(),
                })?;
                let target = index.resolve(&id, &alias, location)?;
                SphereReference {
                    alias,
                    declared: format!("id:{id}"),
                    target,
                }
            }
            (Some(_), Some(_)) => {
                return Err(SphereError::malformed(
                    location,
                    "dependency names both 'path' and 'id'; use exactly one",
                ))
            }
            (None, None) => {
                return Err(SphereError::malformed(
                    location,
                    "dependency needs a 'path' or an 'id'",
                ))
            }
        };

        // Aliases are uppercased into environment names
        if !aliases.insert(reference.alias.to_uppercase()) {
            return Err(SphereError::malformed(
                location,
                format!(
                    "dependency alias '{}' is used twice (aliases are case-insensitive)",
                    reference.alias
                ),
            ));
        }
        if !targets.insert(reference.target.clone()) {
            return Err(SphereError::malformed(
                location,
                format!("dependency {} is listed twice", reference.target.display()),
            ));
        }
        resolved.push(reference);
    }

    Ok(resolved)
}

fn resolve_path(base: &Path, declared: &str) -> Result<PathBuf, String> {
    let candidate = if Path::new(declared).is_absolute() {
        PathBuf::from(declared)
    } else {
        base.join(declared)
    };
    let canonical = std::fs::canonicalize(&candidate)
        .map_err(|e| format!("cannot resolve {}: {e}", candidate.display()))?;
    if !canonical.is_file() {
        return Err(format!("{} is not a file", canonical.display()));
    }
    Ok(canonical)
}
