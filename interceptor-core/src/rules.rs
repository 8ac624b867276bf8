//! Mock rule table
//!
//! Rules are keyed by a pattern string (a bare host, or a host+path fragment)
//! and kept in the order the source listed them. That order breaks ties
//! between substring patterns, so the table is an [`IndexMap`] rather than a
//! hash map.

use crate::error::ConfigLoadError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Status served when a rule does not configure one
pub const DEFAULT_STATUS: u16 = 200;

/// One entry of the rule file, before validation.
///
/// ```yaml
/// api.example.org/v1/users:
///   status: 200
///   content: {"users": [{"id": 1, "name": "Test User"}]}
///   headers:
///     Content-Type: application/json
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub content: Option<serde_yaml::Value>,
    #[serde(default)]
    pub headers: Option<IndexMap<String, serde_json::Value>>,
}

/// Body of a mocked response
#[derive(Debug, Clone, PartialEq)]
pub enum RuleBody {
    /// No content configured
    Empty,
    /// Served verbatim
    Text(String),
    /// Kept as loaded and serialized to JSON text when the response is
    /// synthesized
    Structured(serde_yaml::Value),
}

impl From<Option<serde_yaml::Value>> for RuleBody {
    fn from(content: Option<serde_yaml::Value>) -> Self {
        match content {
            None | Some(serde_yaml::Value::Null) => RuleBody::Empty,
            Some(serde_yaml::Value::String(text)) => RuleBody::Text(text),
            Some(value) => RuleBody::Structured(value),
        }
    }
}

/// A validated interception rule
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub pattern: String,
    pub status_code: u16,
    pub body: RuleBody,
    /// Values are stringified at synthesis time
    pub headers: IndexMap<String, serde_json::Value>,
}

impl Rule {
    /// Rule serving a plain text body with status 200
    pub fn text(pattern: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            status_code: DEFAULT_STATUS,
            body: RuleBody::Text(body.into()),
            headers: IndexMap::new(),
        }
    }

    /// Rule serving a JSON body with status 200
    pub fn json(pattern: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            pattern: pattern.into(),
            status_code: DEFAULT_STATUS,
            // Any JSON value has a YAML form
            body: RuleBody::Structured(serde_yaml::to_value(&body).unwrap_or_default()),
            headers: IndexMap::new(),
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Validate a raw rule file entry
    pub fn from_spec(pattern: &str, spec: RuleSpec) -> Result<Self, ConfigLoadError> {
        if pattern.is_empty() {
            return Err(ConfigLoadError::InvalidRule {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        let status_code = match spec.status {
            None => DEFAULT_STATUS,
            Some(status) if (100..=599).contains(&status) => status as u16,
            Some(status) => {
                return Err(ConfigLoadError::InvalidStatus {
                    pattern: pattern.to_string(),
                    status,
                })
            }
        };

        Ok(Self {
            pattern: pattern.to_string(),
            status_code,
            body: RuleBody::from(spec.content),
            headers: spec.headers.unwrap_or_default(),
        })
    }

    /// Patterns without a `/` only ever match by exact host
    pub fn is_host_only(&self) -> bool {
        !self.pattern.contains('/')
    }
}

/// Immutable, ordered snapshot of all rules.
///
/// A reload builds a fresh `RuleSet` and swaps it in whole; a published set
/// is never mutated.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: IndexMap<String, Arc<Rule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-validated rules. A repeated pattern keeps its first
    /// position and takes the later rule.
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut map = IndexMap::new();
        for rule in rules {
            map.insert(rule.pattern.clone(), Arc::new(rule));
        }
        Self { rules: map }
    }

    /// Validate a parsed rule mapping. Any invalid entry rejects the whole set
    /// so the caller can keep its last-known-good snapshot.
    pub fn from_specs(specs: IndexMap<String, RuleSpec>) -> Result<Self, ConfigLoadError> {
        let mut rules = IndexMap::with_capacity(specs.len());
        for (pattern, spec) in specs {
            let rule = Rule::from_spec(&pattern, spec)?;
            rules.insert(pattern, Arc::new(rule));
        }
        Ok(Self { rules })
    }

    /// Parse a YAML rule document. An empty or null document is an empty set.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigLoadError> {
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        let specs: Option<IndexMap<String, RuleSpec>> = serde_yaml::from_str(text)?;
        Self::from_specs(specs.unwrap_or_default())
    }

    /// Load a rule file. A missing file is not an error: the engine simply
    /// runs with no rules.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Rule file {} not found, running without rules", path.display());
                return Ok(Self::new());
            }
            Err(source) => {
                return Err(ConfigLoadError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let set = Self::from_yaml_str(&text)?;
        debug!("Loaded {} rules from {}", set.len(), path.display());
        Ok(set)
    }

    pub fn get(&self, pattern: &str) -> Option<&Arc<Rule>> {
        self.rules.get(pattern)
    }

    /// Rules in source order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.values()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
