//! Structured traffic events delivered to live observers

use serde::{Deserialize, Serialize};

/// A request seen in the traffic feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestObserved {
    /// `HH:MM:SS` as printed by the proxy
    pub timestamp: String,
    pub method: String,
    pub url: String,
    /// `host:port` when the URL names a port. Unlike
    /// [`RequestDescriptor::host`](crate::exchange::RequestDescriptor::host),
    /// the port is kept.
    pub host: String,
    /// Path plus `?query` when present
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_label: Option<String>,
    /// `{timestamp}_{method}_{host}`; not unique across same-second requests
    /// to one host
    pub id: String,
    /// Rule pattern, when the proxy reported serving a mock for this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
}

/// A response seen in the traffic feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseObserved {
    pub timestamp: String,
    pub status_code: u16,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrafficEvent {
    Request(RequestObserved),
    Response(ResponseObserved),
}

impl TrafficEvent {
    /// Only requests count towards the session's request total
    pub fn is_request(&self) -> bool {
        matches!(self, TrafficEvent::Request(_))
    }

    /// Event name on the observation surface
    pub fn name(&self) -> &'static str {
        match self {
            TrafficEvent::Request(_) => "new_request",
            TrafficEvent::Response(_) => "new_response",
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            TrafficEvent::Request(req) => &req.timestamp,
            TrafficEvent::Response(res) => &res.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = TrafficEvent::Request(RequestObserved {
            timestamp: "12:34:56".to_string(),
            method: "GET".to_string(),
            url: "https://example.com/api/data".to_string(),
            host: "example.com".to_string(),
            path: "/api/data".to_string(),
            client_label: None,
            id: "12:34:56_GET_example.com".to_string(),
            matched_rule: None,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["path"], "/api/data");
        assert!(json.get("clientLabel").is_none());
        assert!(json.get("matchedRule").is_none());

        let response = TrafficEvent::Response(ResponseObserved {
            timestamp: "12:34:57".to_string(),
            status_code: 201,
            content_type: "application/json".to_string(),
            body_preview: Some("{}".to_string()),
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["statusCode"], 201);
        assert_eq!(json["contentType"], "application/json");
        assert_eq!(json["bodyPreview"], "{}");
        assert_eq!(response.name(), "new_response");
        assert!(!response.is_request());
    }
}
