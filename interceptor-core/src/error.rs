//! Error types for interception and traffic observation

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for interceptor operations
#[derive(Debug, Error)]
pub enum InterceptorError {
    /// Rule or blacklist source could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigLoadError),
    /// Network-related errors (binding, proxy runtime)
    #[error("Network error: {0}")]
    Network(String),
    /// Certificate loading errors
    #[error("Certificate error: {0}")]
    Certificate(String),
    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed or unreadable rule/blacklist source.
///
/// Never fatal to the request path: callers log it and keep the
/// last-known-good snapshot.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rules: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("rule '{pattern}' has invalid status code {status}")]
    InvalidStatus { pattern: String, status: i64 },
    #[error("rule '{pattern}' is invalid: {reason}")]
    InvalidRule { pattern: String, reason: String },
}

/// A matched rule could not be synthesized exactly as configured.
///
/// Reported to the caller as a warning; the synthesized response degrades
/// instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("rule '{pattern}': content not serializable ({reason}), using empty body")]
    Content { pattern: String, reason: String },
    #[error("rule '{pattern}': header '{name}' dropped ({reason})")]
    Header {
        pattern: String,
        name: String,
        reason: String,
    },
}

impl SynthesisError {
    /// Pattern of the rule that produced this warning
    pub fn pattern(&self) -> &str {
        match self {
            SynthesisError::Content { pattern, .. } | SynthesisError::Header { pattern, .. } => {
                pattern
            }
        }
    }
}
