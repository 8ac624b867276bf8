//! Interceptor Core Library
//!
//! Decides, per request, whether a configured mock rule replaces the
//! upstream response, and turns the proxy's textual trace into a live stream
//! of structured traffic events with running session state.
//!
//! The interception path is [`InterceptService`] (through [`TrafficHook`]):
//! blacklist, then rule matching in [`engine`], then the transcript written
//! by [`SessionRecorder`]. The observation path is [`TrafficMonitor`], which
//! parses trace lines with [`parser`] and publishes them on the [`EventBus`].

pub mod blacklist;
pub mod bus;
/// Configuration types and utilities
pub mod config;
pub mod engine;
/// Error types for interceptor operations
pub mod error;
pub mod event;
pub mod exchange;
pub mod monitor;
pub mod parser;
pub mod recorder;
pub mod rules;
pub mod service;
pub mod session;

pub use blacklist::Blacklist;
pub use bus::{EventBus, ObserverId, Subscription};
pub use config::{CertificateConfig, InterceptorConfig};
pub use engine::{Decision, Interception, InterceptionEngine, MatchKind, PassReason};
pub use error::{ConfigLoadError, InterceptorError, SynthesisError};
pub use event::{RequestObserved, ResponseObserved, TrafficEvent};
pub use exchange::{RequestDescriptor, ResponseDescriptor};
pub use monitor::{MonitorExit, TrafficMonitor};
pub use parser::NotParseable;
pub use recorder::{SessionRecorder, BODY_PREVIEW_LIMIT};
pub use rules::{Rule, RuleBody, RuleSet, RuleSpec};
pub use service::{InterceptService, Metrics, MetricsSnapshot, TrafficHook};
pub use session::{ProxyMode, SessionState};

/// Result type alias for interceptor operations
pub type Result<T> = std::result::Result<T, InterceptorError>;
