//! Exported values: what a succeeded sphere hands to its dependents.
//!
//! The entrypoint writes `NAME=VALUE` lines to the file named by
//! `$SPHERE_EXPORTS`. Only names the descriptor declares survive, and each
//! value is typed at this boundary.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::descriptor::is_identifier;

/// A typed export value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExportValue {
    String(String),
    Number(f64),
    Boolean(bool),
    /// A JSON object or array.
    Structured(serde_json::Value),
}

impl ExportValue {
    /// Types a raw value: booleans, finite numbers and JSON objects/arrays
    /// are recognised; everything else stays a string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "true" => return ExportValue::Boolean(true),
            "false" => return ExportValue::Boolean(false),
            _ => {}
        }
        if let Ok(n) = raw.parse::<f64>() {
            if n.is_finite() && !raw.trim().is_empty() {
                return ExportValue::Number(n);
            }
        }
        if raw.starts_with('{') || raw.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
                if value.is_object() || value.is_array() {
                    return ExportValue::Structured(value);
                }
            }
        }
        ExportValue::String(raw.to_string())
    }

    /// JSON form, as written to `inputs.json`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ExportValue::String(s) => serde_json::Value::String(s.clone()),
            ExportValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ExportValue::Boolean(b) => serde_json::Value::Bool(*b),
            ExportValue::Structured(v) => v.clone(),
        }
    }
}

impl fmt::Display for ExportValue {
    /// Environment-variable form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportValue::String(s) => f.write_str(s),
            ExportValue::Number(n) => write!(f, "{n}"),
            ExportValue::Boolean(b) => write!(f, "{b}"),
            ExportValue::Structured(v) => write!(f, "{v}"),
        }
    }
}

/// An immutable snapshot of one node's exports, keyed by export name.
pub type Exports = BTreeMap<String, ExportValue>;

/// Parses the exports file content, keeping only `declared` names.
///
/// Later lines win over earlier ones for the same name. Malformed lines and
/// undeclared names are dropped with a log line, never an error.
pub fn parse_exports(content: &str, declared: &[String]) -> Exports {
    let mut exports = Exports::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            warn!("Ignoring malformed export line {}: {line}", lineno + 1);
            continue;
        };
        let name = name.trim();
        if !is_identifier(name) {
            warn!("Ignoring export line {} with invalid name '{name}'", lineno + 1);
            continue;
        }
        if !declared.iter().any(|d| d == name) {
            debug!("Dropping undeclared export '{name}'");
            continue;
        }
        exports.insert(name.to_string(), ExportValue::parse(value));
    }

    for name in declared {
        if !exports.contains_key(name) {
            warn!("Declared export '{name}' was not produced");
        }
    }
    exports
}

/// Environment variable name under which a dependency's export is injected:
/// `SPHERE_DEP_<ALIAS>__<NAME>`, uppercased.
pub fn env_key(alias: &str, name: &str) -> String {
    format!("SPHERE_DEP_{}__{}", alias.to_uppercase(), name.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_value_typing() {
        assert_eq!(ExportValue::parse("true"), ExportValue::Boolean(true));
        assert_eq!(ExportValue::parse("false"), ExportValue::Boolean(false));
        assert_eq!(ExportValue::parse("42"), ExportValue::Number(42.0));
        assert_eq!(ExportValue::parse("-1.5"), ExportValue::Number(-1.5));
        assert_eq!(
            ExportValue::parse("{\"a\": 1}"),
            ExportValue::Structured(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            ExportValue::parse("[1, 2]"),
            ExportValue::Structured(serde_json::json!([1, 2]))
        );
        assert_eq!(
            ExportValue::parse("{not json"),
            ExportValue::String("{not json".to_string())
        );
        assert_eq!(ExportValue::parse("NaN"), ExportValue::String("NaN".to_string()));
        assert_eq!(ExportValue::parse(""), ExportValue::String(String::new()));
        assert_eq!(
            ExportValue::parse("hello world"),
            ExportValue::String("hello world".to_string())
        );
    }

    #[test]
    fn test_display_round_trips_scalars() {
        assert_eq!(ExportValue::Number(3.0).to_string(), "3");
        assert_eq!(ExportValue::Boolean(true).to_string(), "true");
        assert_eq!(
            ExportValue::Structured(serde_json::json!({"k": "v"})).to_string(),
            "{\"k\":\"v\"}"
        );
    }

    #[test]
    fn test_parse_exports_keeps_declared_only() {
        let content = "version=1.2.3\nsecret=hunter2\n# comment\n\nready=true\n";
        let exports = parse_exports(content, &declared(&["version", "ready"]));
        assert_eq!(exports.len(), 2);
        assert_eq!(
            exports.get("version"),
            Some(&ExportValue::String("1.2.3".to_string()))
        );
        assert_eq!(exports.get("ready"), Some(&ExportValue::Boolean(true)));
        assert!(exports.get("secret").is_none());
    }

    #[test]
    fn test_parse_exports_skips_malformed_lines_and_last_wins() {
        let content = "no equals sign\nbad-name=1\ncount=1\ncount=2\n";
        let exports = parse_exports(content, &declared(&["count"]));
        assert_eq!(exports.get("count"), Some(&ExportValue::Number(2.0)));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let exports = parse_exports("url=http://x/?a=b\n", &declared(&["url"]));
        assert_eq!(
            exports.get("url"),
            Some(&ExportValue::String("http://x/?a=b".to_string()))
        );
    }

    #[test]
    fn test_env_key_namespacing() {
        assert_eq!(env_key("build", "version"), "SPHERE_DEP_BUILD__VERSION");
        assert_ne!(env_key("a", "x"), env_key("b", "x"));
        // Underscores inside the alias or the name stay on their side
        assert_ne!(env_key("x", "y_z"), env_key("x_y", "z"));
    }

    #[test]
    fn test_serde_tagging() {
        let json = serde_json::to_value(ExportValue::Number(1.0)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "number", "value": 1.0}));
    }
}
