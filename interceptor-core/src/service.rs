//! The interception context handed to the proxy adapter
//!
//! [`InterceptService`] owns every piece of process state: the engine's rule
//! and blacklist snapshots, the transcript recorder, the event bus and the
//! admin counters. Adapters only see it through [`TrafficHook`].

use crate::blacklist::Blacklist;
use crate::bus::EventBus;
use crate::config::InterceptorConfig;
use crate::engine::{Decision, InterceptionEngine, PassReason};
use crate::error::ConfigLoadError;
use crate::exchange::{RequestDescriptor, ResponseDescriptor};
use crate::recorder::SessionRecorder;
use crate::rules::RuleSet;
use crate::session::SessionState;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Callbacks a proxy engine invokes for every exchange
pub trait TrafficHook: Send + Sync {
    /// Decide what to do with a request before it goes upstream
    fn on_request(&self, request: &RequestDescriptor) -> Decision;

    /// Observe the response that reached the client, upstream or synthesized
    fn on_response(&self, request: &RequestDescriptor, response: &ResponseDescriptor);

    /// Whether `on_response` needs the response body. Adapters may skip
    /// buffering upstream bodies when this is false.
    fn wants_response(&self, _request: &RequestDescriptor) -> bool {
        true
    }
}

/// Counters served on the admin `/metrics` endpoint
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub intercepted: AtomicU64,
    pub blacklisted: AtomicU64,
    pub passed_through: AtomicU64,
    pub responses_observed: AtomicU64,
    pub synthesis_warnings: AtomicU64,
    pub reload_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub intercepted: u64,
    pub blacklisted: u64,
    pub passed_through: u64,
    pub responses_observed: u64,
    pub synthesis_warnings: u64,
    pub reload_failures: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            intercepted: self.intercepted.load(Ordering::Relaxed),
            blacklisted: self.blacklisted.load(Ordering::Relaxed),
            passed_through: self.passed_through.load(Ordering::Relaxed),
            responses_observed: self.responses_observed.load(Ordering::Relaxed),
            synthesis_warnings: self.synthesis_warnings.load(Ordering::Relaxed),
            reload_failures: self.reload_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct InterceptService {
    engine: InterceptionEngine,
    recorder: SessionRecorder,
    bus: EventBus,
    metrics: Metrics,
    rules_path: PathBuf,
    blacklist_path: PathBuf,
    port: u16,
}

impl InterceptService {
    /// Build the context from startup configuration. Unreadable rule or
    /// blacklist sources are logged and start out empty.
    pub fn new(config: &InterceptorConfig, recorder: SessionRecorder) -> Self {
        let rules = RuleSet::load(&config.rules_path).unwrap_or_else(|e| {
            warn!("Starting without interception rules: {}", e);
            RuleSet::new()
        });
        let blacklist = Blacklist::load(&config.blacklist_path).unwrap_or_else(|e| {
            warn!("Starting without blacklist: {}", e);
            Blacklist::default()
        });
        info!(
            "Loaded {} interception rules and {} blacklisted hosts",
            rules.len(),
            blacklist.len()
        );

        Self {
            engine: InterceptionEngine::new(rules, blacklist),
            recorder,
            bus: EventBus::new(
                SessionState::new(config.listen_port, config.mode),
                config.observer_capacity,
            ),
            metrics: Metrics::default(),
            rules_path: config.rules_path.clone(),
            blacklist_path: config.blacklist_path.clone(),
            port: config.listen_port,
        }
    }

    pub fn engine(&self) -> &InterceptionEngine {
        &self.engine
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn rules_path(&self) -> &Path {
        &self.rules_path
    }

    pub fn blacklist_path(&self) -> &Path {
        &self.blacklist_path
    }

    /// Write the transcript banner and mark the session as running
    pub fn start_session(&self) {
        self.recorder
            .session_header(&self.engine.rules(), &self.engine.blacklist());
        self.bus.begin_session(self.port, self.recorder.mode());
    }

    /// Re-read the rule file. On failure the current rules stay published.
    pub fn reload_rules(&self) -> Result<usize, ConfigLoadError> {
        match RuleSet::load(&self.rules_path) {
            Ok(rules) => {
                let count = rules.len();
                self.engine.replace_rules(rules);
                Ok(count)
            }
            Err(e) => {
                self.metrics.reload_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Keeping previous rules, reload failed: {}", e);
                Err(e)
            }
        }
    }

    /// Re-read the blacklist file. On failure the current list stays
    /// published.
    pub fn reload_blacklist(&self) -> Result<usize, ConfigLoadError> {
        match Blacklist::load(&self.blacklist_path) {
            Ok(blacklist) => {
                let count = blacklist.len();
                self.engine.replace_blacklist(blacklist);
                Ok(count)
            }
            Err(e) => {
                self.metrics.reload_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Keeping previous blacklist, reload failed: {}", e);
                Err(e)
            }
        }
    }
}

impl TrafficHook for InterceptService {
    fn on_request(&self, request: &RequestDescriptor) -> Decision {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        let decision = self.engine.decide(request);

        match &decision {
            Decision::PassThrough(PassReason::Blacklisted) => {
                self.metrics.blacklisted.fetch_add(1, Ordering::Relaxed);
            }
            Decision::PassThrough(PassReason::NoMatchingRule) => {
                self.metrics.passed_through.fetch_add(1, Ordering::Relaxed);
            }
            Decision::Intercept(interception) => {
                self.metrics.intercepted.fetch_add(1, Ordering::Relaxed);
                for warning in &interception.warnings {
                    warn!("Rule '{}' degraded: {}", warning.pattern(), warning);
                }
                self.metrics
                    .synthesis_warnings
                    .fetch_add(interception.warnings.len() as u64, Ordering::Relaxed);
            }
        }

        self.recorder.record_request(request, &decision);
        decision
    }

    fn on_response(&self, request: &RequestDescriptor, response: &ResponseDescriptor) {
        if self.engine.is_blocked(&request.host) {
            return;
        }
        self.metrics.responses_observed.fetch_add(1, Ordering::Relaxed);
        self.recorder.record_response(request, response);
    }

    fn wants_response(&self, request: &RequestDescriptor) -> bool {
        !self.engine.is_blocked(&request.host) && self.recorder.wants_response(request)
    }
}
