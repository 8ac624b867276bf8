//! Request and response descriptors handed over by the proxy adapter

use bytes::Bytes;
use uuid::Uuid;

/// One intercepted request as seen by the decision engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Adapter-assigned key pairing this request with its response
    pub exchange_id: Uuid,
    pub full_url: String,
    /// Host name without the port, as blacklist and host rules compare it.
    /// Not comparable with [`RequestObserved::host`](crate::event::RequestObserved::host),
    /// which keeps `host:port`.
    pub host: String,
    /// Path plus `?query` when present
    pub path: String,
    pub method: String,
    /// Short client label derived from the User-Agent
    pub user_agent_hint: Option<String>,
}

impl RequestDescriptor {
    /// Describe a request from its method and absolute URL. Host and path are
    /// derived from the URL; an unparseable URL leaves the host empty and uses
    /// the raw URL as path.
    pub fn new(method: impl Into<String>, full_url: impl Into<String>) -> Self {
        let full_url = full_url.into();
        let (host, path) = match url::Url::parse(&full_url) {
            Ok(parsed) => (
                parsed.host_str().unwrap_or("").to_string(),
                path_and_query(&parsed),
            ),
            Err(_) => (String::new(), full_url.clone()),
        };

        Self {
            exchange_id: Uuid::new_v4(),
            full_url,
            host,
            path,
            method: method.into(),
            user_agent_hint: None,
        }
    }

    /// Override the host, e.g. from the `Host` header of an origin-form request
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent_hint = client_label(user_agent).map(str::to_string);
        self
    }

    /// Full URL with any leading `scheme://` removed
    pub fn url_without_scheme(&self) -> &str {
        self.full_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.full_url)
    }
}

/// Path plus `?query` of a parsed URL
pub fn path_and_query(url: &url::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Map a User-Agent to a short browser label.
///
/// Chrome and Edge user agents also advertise `Safari`, so the more specific
/// tokens are checked first.
pub fn client_label(user_agent: &str) -> Option<&'static str> {
    if user_agent.contains("Firefox") {
        Some("Firefox")
    } else if user_agent.contains("Chrome") {
        Some("Chrome")
    } else if user_agent.contains("Safari") {
        Some("Safari")
    } else {
        None
    }
}

/// A response, either from upstream or synthesized from a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseDescriptor {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value with the given name, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
