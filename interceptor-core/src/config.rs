//! Configuration types and utilities

use crate::bus::DEFAULT_OBSERVER_CAPACITY;
use crate::session::ProxyMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default proxy listen port
pub const DEFAULT_PROXY_PORT: u16 = 4545;
/// Default admin/observation API port
pub const DEFAULT_ADMIN_PORT: u16 = 5678;

/// Startup configuration for an interceptor process.
/// Rules and blacklist can be reloaded at runtime; everything else is fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on
    pub listen_port: u16,
    /// Admin API port
    pub admin_port: u16,
    /// YAML rule table
    pub rules_path: PathBuf,
    /// One host per line
    pub blacklist_path: PathBuf,
    /// Human-readable session transcript; `None` disables it
    pub transcript_path: Option<PathBuf>,
    pub mode: ProxyMode,
    /// Per-observer event buffer
    pub observer_capacity: usize,
    /// Buffered trace blocks between recorder and monitor
    pub trace_capacity: usize,
    /// Certificate configuration
    pub certificate_config: CertificateConfig,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: DEFAULT_PROXY_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            rules_path: PathBuf::from("interceptor.config.yaml"),
            blacklist_path: PathBuf::from("domain_blacklist.txt"),
            transcript_path: Some(PathBuf::from("logs/url_log.txt")),
            mode: ProxyMode::Minimal,
            observer_capacity: DEFAULT_OBSERVER_CAPACITY,
            trace_capacity: 1024,
            certificate_config: CertificateConfig::default(),
        }
    }
}

impl InterceptorConfig {
    /// `listen_address:listen_port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }
}

/// Existing CA used to sign per-host leaf certificates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// PEM encoded CA certificate
    pub ca_cert_path: PathBuf,
    /// PEM encoded CA private key
    pub ca_key_path: PathBuf,
    /// Leaf certificates kept in the signing cache
    pub cache_size: u64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: PathBuf::from("certs/ca.pem"),
            ca_key_path: PathBuf::from("certs/ca.key"),
            cache_size: 1000,
        }
    }
}
