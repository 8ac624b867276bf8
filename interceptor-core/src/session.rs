use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much the proxy prints to its trace output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Request lines plus POST responses
    #[default]
    Minimal,
    /// Every response, with body previews
    Verbose,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyMode::Minimal => write!(f, "minimal"),
            ProxyMode::Verbose => write!(f, "verbose"),
        }
    }
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(ProxyMode::Minimal),
            "verbose" => Ok(ProxyMode::Verbose),
            other => Err(format!("unknown proxy mode '{}'", other)),
        }
    }
}

/// Snapshot of the live-monitoring session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub requests_count: u64,
    pub running: bool,
    pub start_time: Option<DateTime<Local>>,
    pub port: u16,
    pub mode: ProxyMode,
}

impl SessionState {
    pub fn new(port: u16, mode: ProxyMode) -> Self {
        Self {
            requests_count: 0,
            running: false,
            start_time: None,
            port,
            mode,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PROXY_PORT, ProxyMode::default())
    }
}
