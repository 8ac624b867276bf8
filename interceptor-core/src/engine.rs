//! Interception decision engine
//!
//! Decides, per request, whether a mock rule applies and synthesizes the
//! substitute response. Matching runs in strict priority order and the first
//! hit wins:
//!
//! 1. blacklisted host: pass through, rules are never consulted
//! 2. exact key on the URL without its scheme
//! 3. exact key on the host
//! 4. first key (in source order) containing `/` that is a substring of the
//!    URL without its scheme
//! 5. pass through

use crate::blacklist::Blacklist;
use crate::error::SynthesisError;
use crate::exchange::{RequestDescriptor, ResponseDescriptor};
use crate::rules::{Rule, RuleBody, RuleSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Why a request was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    Blacklisted,
    NoMatchingRule,
}

/// Which matching step selected the rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ExactUrl,
    Host,
    Substring,
}

/// A matched rule and the response that replaces the upstream one
#[derive(Debug, Clone)]
pub struct Interception {
    pub rule: Arc<Rule>,
    pub matched_by: MatchKind,
    pub response: ResponseDescriptor,
    /// Degradations applied while synthesizing; empty when the rule was used
    /// exactly as configured
    pub warnings: Vec<SynthesisError>,
}

#[derive(Debug, Clone)]
pub enum Decision {
    PassThrough(PassReason),
    Intercept(Interception),
}

impl Decision {
    pub fn is_intercept(&self) -> bool {
        matches!(self, Decision::Intercept(_))
    }

    pub fn interception(&self) -> Option<&Interception> {
        match self {
            Decision::Intercept(interception) => Some(interception),
            Decision::PassThrough(_) => None,
        }
    }
}

/// Find the rule for a request, ignoring the blacklist
pub fn match_rule<'a>(
    request: &RequestDescriptor,
    rules: &'a RuleSet,
) -> Option<(&'a Arc<Rule>, MatchKind)> {
    let url = request.url_without_scheme();

    if let Some(rule) = rules.get(url) {
        return Some((rule, MatchKind::ExactUrl));
    }

    if let Some(rule) = rules.get(&request.host) {
        return Some((rule, MatchKind::Host));
    }

    // Host-only keys were already checked above
    rules
        .iter()
        .find(|rule| !rule.is_host_only() && url.contains(rule.pattern.as_str()))
        .map(|rule| (rule, MatchKind::Substring))
}

/// Build the mocked response for a rule.
///
/// Never fails: content that cannot be serialized becomes an empty body and
/// unusable headers are dropped, each reported as a warning.
pub fn synthesize(rule: &Rule) -> (ResponseDescriptor, Vec<SynthesisError>) {
    let mut warnings = Vec::new();

    let body = match &rule.body {
        RuleBody::Empty => Vec::new(),
        RuleBody::Text(text) => text.as_bytes().to_vec(),
        RuleBody::Structured(value) => {
            match content_to_json(value).and_then(|json| {
                serde_json::to_vec(&json).map_err(|e| e.to_string())
            }) {
                Ok(bytes) => bytes,
                Err(reason) => {
                    warnings.push(SynthesisError::Content {
                        pattern: rule.pattern.clone(),
                        reason,
                    });
                    Vec::new()
                }
            }
        }
    };

    let mut response = ResponseDescriptor::new(rule.status_code).with_body(body);
    for (name, value) in &rule.headers {
        let value = header_value_string(value);
        if let Err(reason) = validate_header(name, &value) {
            warnings.push(SynthesisError::Header {
                pattern: rule.pattern.clone(),
                name: name.clone(),
                reason: reason.to_string(),
            });
            continue;
        }
        response.headers.push((name.clone(), value));
    }

    (response, warnings)
}

/// JSON form of loaded rule content. Fails on values JSON has no form for:
/// non-finite numbers and mapping keys that are not scalars.
fn content_to_json(value: &serde_yaml::Value) -> Result<serde_json::Value, String> {
    use serde_yaml::Value as Yaml;

    Ok(match value {
        Yaml::Null => serde_json::Value::Null,
        Yaml::Bool(b) => serde_json::Value::Bool(*b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else if let Some(u) = n.as_u64() {
                u.into()
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                serde_json::Number::from_f64(f)
                    .map(serde_json::Value::Number)
                    .ok_or_else(|| format!("non-finite number {}", n))?
            }
        }
        Yaml::String(s) => serde_json::Value::String(s.clone()),
        Yaml::Sequence(items) => serde_json::Value::Array(
            items.iter().map(content_to_json).collect::<Result<_, _>>()?,
        ),
        Yaml::Mapping(map) => {
            let mut object = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let key = match key {
                    Yaml::String(s) => s.clone(),
                    Yaml::Number(n) => n.to_string(),
                    Yaml::Bool(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    other => return Err(format!("non-scalar mapping key {:?}", other)),
                };
                object.insert(key, content_to_json(value)?);
            }
            serde_json::Value::Object(object)
        }
        Yaml::Tagged(tagged) => content_to_json(&tagged.value)?,
    })
}

/// Full decision for one request
pub fn decide(request: &RequestDescriptor, rules: &RuleSet, blacklist: &Blacklist) -> Decision {
    if blacklist.is_blocked(&request.host) {
        return Decision::PassThrough(PassReason::Blacklisted);
    }

    match match_rule(request, rules) {
        Some((rule, matched_by)) => {
            let (response, warnings) = synthesize(rule);
            Decision::Intercept(Interception {
                rule: rule.clone(),
                matched_by,
                response,
                warnings,
            })
        }
        None => Decision::PassThrough(PassReason::NoMatchingRule),
    }
}

fn header_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn validate_header(name: &str, value: &str) -> Result<(), &'static str> {
    let is_tchar = |c: char| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c);
    if name.is_empty() || !name.chars().all(is_tchar) {
        return Err("invalid header name");
    }
    if value.contains(['\r', '\n', '\0']) {
        return Err("control character in value");
    }
    Ok(())
}

/// Holds the published rule and blacklist snapshots.
///
/// Readers clone the current `Arc` and decide against it, so a concurrent
/// reload is seen either entirely or not at all.
#[derive(Debug, Default)]
pub struct InterceptionEngine {
    rules: RwLock<Arc<RuleSet>>,
    blacklist: RwLock<Arc<Blacklist>>,
}

impl InterceptionEngine {
    pub fn new(rules: RuleSet, blacklist: Blacklist) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            blacklist: RwLock::new(Arc::new(blacklist)),
        }
    }

    /// Current rule snapshot
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Current blacklist snapshot
    pub fn blacklist(&self) -> Arc<Blacklist> {
        self.blacklist
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Publish a new rule set, replacing the old one whole
    pub fn replace_rules(&self, rules: RuleSet) {
        info!("Publishing {} interception rules", rules.len());
        *self
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(rules);
    }

    pub fn replace_blacklist(&self, blacklist: Blacklist) {
        info!("Publishing blacklist with {} hosts", blacklist.len());
        *self
            .blacklist
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(blacklist);
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.blacklist().is_blocked(host)
    }

    pub fn decide(&self, request: &RequestDescriptor) -> Decision {
        let rules = self.rules();
        let blacklist = self.blacklist();
        let decision = decide(request, &rules, &blacklist);
        debug!(
            "Decision for {} {}: {}",
            request.method,
            request.full_url,
            match &decision {
                Decision::Intercept(i) => i.rule.pattern.as_str(),
                Decision::PassThrough(PassReason::Blacklisted) => "blacklisted",
                Decision::PassThrough(PassReason::NoMatchingRule) => "pass",
            }
        );
        decision
    }
}
