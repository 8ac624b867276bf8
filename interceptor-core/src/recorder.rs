//! Human-readable session transcript
//!
//! The recorder writes the same line grammar the parser accepts, so its
//! output doubles as the live trace feed. Each request or response becomes
//! one block of lines; a block is written to the transcript under one lock
//! and sent to the trace channel as one message so concurrent exchanges never
//! interleave inside a response's body preview.

use crate::blacklist::Blacklist;
use crate::engine::{Decision, PassReason};
use crate::error::InterceptorError;
use crate::exchange::{RequestDescriptor, ResponseDescriptor};
use crate::parser::{CONTINUATION_INDENT, EMPTY_BODY_MARKER, INTERCEPT_VERB, RESPONSE_MARKER};
use crate::rules::RuleSet;
use crate::session::ProxyMode;
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Characters of response body kept in the preview
pub const BODY_PREVIEW_LIMIT: usize = 500;

#[derive(Debug)]
pub struct SessionRecorder {
    mode: ProxyMode,
    transcript: Option<Mutex<BufWriter<File>>>,
    trace: Option<mpsc::Sender<String>>,
    dropped_blocks: AtomicU64,
}

impl SessionRecorder {
    pub fn new(mode: ProxyMode) -> Self {
        Self {
            mode,
            transcript: None,
            trace: None,
            dropped_blocks: AtomicU64::new(0),
        }
    }

    /// Append the transcript to `path`, creating parent directories
    pub fn with_transcript(mut self, path: &Path) -> Result<Self, InterceptorError> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.transcript = Some(Mutex::new(BufWriter::new(file)));
        Ok(self)
    }

    /// Mirror every block into a trace channel. Blocks are dropped, never
    /// waited on, when the channel is full.
    pub fn with_trace(mut self, sender: mpsc::Sender<String>) -> Self {
        self.trace = Some(sender);
        self
    }

    pub fn mode(&self) -> ProxyMode {
        self.mode
    }

    /// Blocks the trace channel could not take
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks.load(Ordering::Relaxed)
    }

    /// Transcript-only banner opening a session
    pub fn session_header(&self, rules: &RuleSet, blacklist: &Blacklist) {
        let mut lines = vec![
            String::new(),
            format!(
                "=== Proxy Session Started at {} ===",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            ),
            String::new(),
        ];
        if !blacklist.is_empty() {
            lines.push(format!("Blacklisted domains: {}", blacklist.entries().join(", ")));
        }
        if !rules.is_empty() {
            lines.push(format!("Intercepting {} URL patterns", rules.len()));
        }
        lines.push(String::new());
        self.write_transcript(&lines);
    }

    /// Record the decision taken for a request. Blacklisted hosts leave no
    /// trace.
    pub fn record_request(&self, request: &RequestDescriptor, decision: &Decision) {
        let Some(lines) = request_lines(&timestamp(), request, decision) else {
            return;
        };
        self.emit(lines);
    }

    /// Record a response. Minimal mode only records responses to POST
    /// requests.
    pub fn record_response(&self, request: &RequestDescriptor, response: &ResponseDescriptor) {
        if !self.wants_response(request) {
            return;
        }
        self.emit(response_lines(&timestamp(), response));
    }

    /// Whether `record_response` would record anything for this request
    pub fn wants_response(&self, request: &RequestDescriptor) -> bool {
        self.mode == ProxyMode::Verbose || request.method.eq_ignore_ascii_case("POST")
    }

    fn emit(&self, lines: Vec<String>) {
        self.write_transcript(&lines);

        if let Some(trace) = &self.trace {
            match trace.try_send(lines.join("\n")) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped_blocks.fetch_add(1, Ordering::Relaxed);
                    debug!("Trace channel full, dropping block");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Trace channel closed");
                }
            }
        }
    }

    fn write_transcript(&self, lines: &[String]) {
        let Some(transcript) = &self.transcript else {
            return;
        };
        let mut writer = transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = lines
            .iter()
            .try_for_each(|line| writeln!(writer, "{}", line))
            .and_then(|()| writer.flush());
        if let Err(e) = result {
            warn!("Failed to write transcript: {}", e);
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Trace lines for a request decision
pub fn request_lines(
    stamp: &str,
    request: &RequestDescriptor,
    decision: &Decision,
) -> Option<Vec<String>> {
    let line = match decision {
        Decision::PassThrough(PassReason::Blacklisted) => return None,
        Decision::Intercept(interception) => {
            let line = format!(
                "[{}] {} {} {} -> using rule '{}'",
                stamp, INTERCEPT_VERB, request.method, request.full_url, interception.rule.pattern
            );
            match &request.user_agent_hint {
                Some(label) => format!("{} [{}]", line, label),
                None => line,
            }
        }
        Decision::PassThrough(PassReason::NoMatchingRule) => match &request.user_agent_hint {
            Some(label) => format!("[{}] {} {} [{}]", stamp, request.method, request.full_url, label),
            None => format!("[{}] {} {}", stamp, request.method, request.full_url),
        },
    };
    Some(vec![line])
}

/// Trace lines for a response: the status line, the indented body preview
/// and a closing blank line
pub fn response_lines(stamp: &str, response: &ResponseDescriptor) -> Vec<String> {
    let content_type = response.content_type();
    let status_line = if content_type.is_empty() {
        format!("[{}] {} {}", stamp, RESPONSE_MARKER, response.status_code)
    } else {
        format!(
            "[{}] {} {} {}",
            stamp, RESPONSE_MARKER, response.status_code, content_type
        )
    };

    let mut lines = vec![status_line];
    let preview = body_preview(&response.body_text(), content_type);
    if preview.trim().is_empty() {
        lines.push(format!("{}{}", CONTINUATION_INDENT, EMPTY_BODY_MARKER));
    } else {
        lines.extend(
            preview
                .split('\n')
                .map(|line| format!("{}{}", CONTINUATION_INDENT, line)),
        );
    }
    lines.push(String::new());
    lines
}

/// Body text cut to [`BODY_PREVIEW_LIMIT`] characters; JSON bodies are
/// pretty-printed first
pub fn body_preview(body: &str, content_type: &str) -> String {
    if content_type.contains("application/json") {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                return pretty.chars().take(BODY_PREVIEW_LIMIT).collect();
            }
        }
    }

    if body.chars().count() > BODY_PREVIEW_LIMIT {
        let mut cut: String = body.chars().take(BODY_PREVIEW_LIMIT).collect();
        cut.push_str("... (truncated)");
        cut
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decide;
    use crate::event::TrafficEvent;
    use crate::parser::parse;
    use crate::rules::Rule;

    fn rules() -> RuleSet {
        RuleSet::from_rules(vec![Rule::text("mock.example.com", "mocked")])
    }

    #[test]
    fn test_request_lines_follow_trace_grammar() {
        let blacklist = Blacklist::new(vec!["ads.net"]);
        let plain = RequestDescriptor::new("GET", "https://example.com/a?b=1")
            .with_user_agent("Mozilla/5.0 Firefox/121.0");
        let lines = request_lines("10:00:00", &plain, &decide(&plain, &rules(), &blacklist)).unwrap();
        assert_eq!(lines, vec!["[10:00:00] GET https://example.com/a?b=1 [Firefox]"]);
        match parse(&lines[0]) {
            Ok(TrafficEvent::Request(req)) => {
                assert_eq!(req.path, "/a?b=1");
                assert_eq!(req.client_label.as_deref(), Some("Firefox"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let mocked = RequestDescriptor::new("POST", "https://mock.example.com/x");
        let lines = request_lines("10:00:01", &mocked, &decide(&mocked, &rules(), &blacklist)).unwrap();
        assert_eq!(
            lines,
            vec!["[10:00:01] INTERCEPTING POST https://mock.example.com/x -> using rule 'mock.example.com'"]
        );
        match parse(&lines[0]) {
            Ok(TrafficEvent::Request(req)) => {
                assert_eq!(req.method, "POST");
                assert_eq!(req.matched_rule.as_deref(), Some("mock.example.com"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let labelled = RequestDescriptor::new("GET", "https://mock.example.com/y")
            .with_user_agent("Mozilla/5.0 Firefox/121.0");
        let lines = request_lines("10:00:02", &labelled, &decide(&labelled, &rules(), &blacklist)).unwrap();
        assert_eq!(
            lines,
            vec!["[10:00:02] INTERCEPTING GET https://mock.example.com/y -> using rule 'mock.example.com' [Firefox]"]
        );
        match parse(&lines[0]) {
            Ok(TrafficEvent::Request(req)) => {
                assert_eq!(req.url, "https://mock.example.com/y");
                assert_eq!(req.client_label.as_deref(), Some("Firefox"));
                assert_eq!(req.matched_rule.as_deref(), Some("mock.example.com"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let blocked = RequestDescriptor::new("GET", "https://cdn.ads.net/pixel");
        assert!(request_lines("10:00:02", &blocked, &decide(&blocked, &rules(), &blacklist)).is_none());
    }

    #[test]
    fn test_response_lines() {
        let response = ResponseDescriptor::new(201)
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"id":1}"#);
        let lines = response_lines("10:00:03", &response);
        assert_eq!(
            lines,
            vec![
                "[10:00:03] └─ Response: 201 application/json",
                "    {",
                "      \"id\": 1",
                "    }",
                "",
            ]
        );

        let empty = response_lines("10:00:04", &ResponseDescriptor::new(204));
        assert_eq!(
            empty,
            vec!["[10:00:04] └─ Response: 204", "    (empty response)", ""]
        );
    }

    #[test]
    fn test_body_preview_truncates() {
        let long = "x".repeat(BODY_PREVIEW_LIMIT + 10);
        let preview = body_preview(&long, "text/plain");
        assert!(preview.ends_with("... (truncated)"));
        assert_eq!(preview.chars().count(), BODY_PREVIEW_LIMIT + "... (truncated)".len());

        assert_eq!(body_preview("not json", "application/json"), "not json");
        assert_eq!(body_preview("short", "text/plain"), "short");
    }

    #[test]
    fn test_minimal_mode_records_only_post_responses() {
        let recorder = SessionRecorder::new(ProxyMode::Minimal);
        assert!(recorder.wants_response(&RequestDescriptor::new("POST", "https://a.com/")));
        assert!(!recorder.wants_response(&RequestDescriptor::new("GET", "https://a.com/")));

        let verbose = SessionRecorder::new(ProxyMode::Verbose);
        assert!(verbose.wants_response(&RequestDescriptor::new("GET", "https://a.com/")));
    }

    #[tokio::test]
    async fn test_blocks_reach_trace_channel_and_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("url_log.txt");
        let (tx, mut rx) = mpsc::channel(8);
        let recorder = SessionRecorder::new(ProxyMode::Minimal)
            .with_transcript(&path)
            .unwrap()
            .with_trace(tx);

        recorder.session_header(&rules(), &Blacklist::new(vec!["ads.net"]));
        let request = RequestDescriptor::new("POST", "https://example.com/submit");
        recorder.record_request(&request, &decide(&request, &rules(), &Blacklist::default()));
        recorder.record_response(
            &request,
            &ResponseDescriptor::new(200).with_header("Content-Type", "text/plain").with_body("ok"),
        );

        let first = rx.recv().await.unwrap();
        assert!(first.ends_with("POST https://example.com/submit"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.split('\n').count(), 3);
        // The closing blank line is what flushes the response in the monitor
        assert!(second.ends_with("    ok\n"));
        assert!(second.contains("└─ Response: 200 text/plain"));
        assert!(rx.try_recv().is_err());

        let transcript = std::fs::read_to_string(&path).unwrap();
        assert!(transcript.contains("=== Proxy Session Started at"));
        assert!(transcript.contains("Blacklisted domains: ads.net"));
        assert!(transcript.contains("Intercepting 1 URL patterns"));
        assert!(transcript.contains("    ok\n"));
    }

    #[test]
    fn test_full_trace_channel_drops_blocks() {
        let (tx, _rx) = mpsc::channel(1);
        let recorder = SessionRecorder::new(ProxyMode::Minimal).with_trace(tx);
        let request = RequestDescriptor::new("GET", "https://example.com/");
        let decision = decide(&request, &RuleSet::new(), &Blacklist::default());
        recorder.record_request(&request, &decision);
        recorder.record_request(&request, &decision);
        assert_eq!(recorder.dropped_blocks(), 1);
    }
}
