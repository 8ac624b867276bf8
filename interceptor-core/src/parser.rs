//! Traffic line tokenizer
//!
//! Accepted grammar (one line at a time, surrounding whitespace ignored):
//!
//! ```text
//! request   = stamp ws+ method ws+ url [ ws+ "[" label "]" ]
//! intercept = stamp ws+ "INTERCEPTING" ws+ method ws+ url " -> using rule '" pattern "'" [ " [" label "]" ]
//! response  = [ stamp ] ... "└─ Response:" ... status(3 digits) [ content-type ]
//! stamp     = "[" DD ":" DD ":" DD "]"
//! method    = word characters
//! ```
//!
//! Lines indented by four spaces after a response line carry its body
//! preview; see [`continuation`]. An `INTERCEPTING` line without a
//! well-formed rule suffix is read as a plain request line. Everything else
//! is [`NotParseable`].

use crate::event::{RequestObserved, ResponseObserved, TrafficEvent};
use crate::exchange::path_and_query;
use std::fmt;

/// Marker the proxy prints in front of response details
pub const RESPONSE_MARKER: &str = "└─ Response:";
/// Verb the proxy prints in place of the method when it served a mock
pub const INTERCEPT_VERB: &str = "INTERCEPTING";
/// Prefix of body preview lines
pub const CONTINUATION_INDENT: &str = "    ";
/// Body preview line printed for an empty response body
pub const EMPTY_BODY_MARKER: &str = "(empty response)";

const RULE_MARKER: &str = " -> using rule '";
const STAMP_LEN: usize = 10;

/// The line has none of the recognized shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotParseable;

impl fmt::Display for NotParseable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line not parseable")
    }
}

impl std::error::Error for NotParseable {}

/// Parse one line of proxy trace output.
///
/// A response line without a timestamp is stamped with the current local
/// time.
pub fn parse(raw: &str) -> Result<TrafficEvent, NotParseable> {
    let line = raw.trim();
    if line.is_empty() {
        return Err(NotParseable);
    }

    let event = match line.split_once(RESPONSE_MARKER) {
        Some((before, after)) => parse_response(before, after),
        None => parse_request(line),
    };
    event.ok_or(NotParseable)
}

/// Body preview text of an indented continuation line
pub fn continuation(raw: &str) -> Option<&str> {
    raw.strip_prefix(CONTINUATION_INDENT)
        .map(|text| text.trim_end_matches(['\r', '\n']))
}

fn parse_response(before: &str, after: &str) -> Option<TrafficEvent> {
    let timestamp = find_stamp(before)
        .map(str::to_string)
        .unwrap_or_else(|| chrono::Local::now().format("%H:%M:%S").to_string());

    let details = after.trim();
    let start = find_digit_run(details, 3)?;
    let status_code = details[start..start + 3].parse().ok()?;
    let content_type = details[start + 3..].trim().to_string();

    Some(TrafficEvent::Response(ResponseObserved {
        timestamp,
        status_code,
        content_type,
        body_preview: None,
    }))
}

fn parse_request(line: &str) -> Option<TrafficEvent> {
    let timestamp = stamp_at(line, 0)?;
    let rest = skip_required_ws(&line[STAMP_LEN..])?;
    let (method, rest) = split_word(rest)?;
    let rest = skip_required_ws(rest)?;
    if rest.is_empty() {
        return None;
    }

    if method == INTERCEPT_VERB {
        if let Some(event) = parse_intercept(timestamp, rest) {
            return Some(event);
        }
    }

    let (url, client_label) = split_label(rest);
    Some(TrafficEvent::Request(request_event(
        timestamp,
        method,
        url,
        client_label.map(str::to_string),
        None,
    )))
}

fn parse_intercept(timestamp: &str, rest: &str) -> Option<TrafficEvent> {
    let (method, rest) = split_word(rest)?;
    let rest = skip_required_ws(rest)?;
    let (url, tail) = rest.rsplit_once(RULE_MARKER)?;
    let (pattern, client_label) = match tail.strip_suffix('\'') {
        Some(pattern) => (pattern, None),
        None => {
            let (pattern, label) = tail.rsplit_once("' [")?;
            let label = label.strip_suffix(']').filter(|label| !label.is_empty())?;
            (pattern, Some(label.to_string()))
        }
    };
    let url = url.trim_end();
    if url.is_empty() {
        return None;
    }

    Some(TrafficEvent::Request(request_event(
        timestamp,
        method,
        url,
        client_label,
        Some(pattern.to_string()),
    )))
}

fn request_event(
    timestamp: &str,
    method: &str,
    url: &str,
    client_label: Option<String>,
    matched_rule: Option<String>,
) -> RequestObserved {
    let (host, path) = match url::Url::parse(url) {
        Ok(parsed) => {
            let host = match (parsed.host_str(), parsed.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => host.to_string(),
                (None, _) => String::new(),
            };
            (host, path_and_query(&parsed))
        }
        Err(_) => (String::new(), url.to_string()),
    };

    RequestObserved {
        timestamp: timestamp.to_string(),
        method: method.to_string(),
        url: url.to_string(),
        id: format!("{}_{}_{}", timestamp, method, host),
        host,
        path,
        client_label,
        matched_rule,
    }
}

/// `HH:MM:SS` inside a `[HH:MM:SS]` stamp starting at byte `at`
fn stamp_at(text: &str, at: usize) -> Option<&str> {
    let bytes = text.as_bytes().get(at..at + STAMP_LEN)?;
    let shape_ok = bytes[0] == b'['
        && bytes[9] == b']'
        && bytes[3] == b':'
        && bytes[6] == b':'
        && [1, 2, 4, 5, 7, 8].iter().all(|&i| bytes[i].is_ascii_digit());
    if shape_ok {
        // All ten bytes are ASCII, so these are char boundaries
        Some(&text[at + 1..at + 9])
    } else {
        None
    }
}

fn find_stamp(text: &str) -> Option<&str> {
    text.match_indices('[')
        .find_map(|(at, _)| stamp_at(text, at))
}

/// Byte offset of the first run of `len` consecutive ASCII digits
fn find_digit_run(text: &str, len: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut run = 0;
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_digit() {
            run += 1;
            if run == len {
                return Some(i + 1 - len);
            }
        } else {
            run = 0;
        }
    }
    None
}

/// Strip leading whitespace, requiring at least one whitespace character
fn skip_required_ws(text: &str) -> Option<&str> {
    let trimmed = text.trim_start();
    if trimmed.len() < text.len() {
        Some(trimmed)
    } else {
        None
    }
}

/// Split a leading run of word characters off `text`
fn split_word(text: &str) -> Option<(&str, &str)> {
    let end = text
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(text.len());
    if end == 0 {
        None
    } else {
        Some(text.split_at(end))
    }
}

/// Split `url [label]` at the first whitespace after which only a bracketed,
/// non-empty label remains
fn split_label(text: &str) -> (&str, Option<&str>) {
    for (at, c) in text.char_indices().skip(1) {
        if !c.is_whitespace() {
            continue;
        }
        let tail = text[at..].trim_start();
        if tail.len() > 2 && tail.starts_with('[') && tail.ends_with(']') {
            return (&text[..at], Some(&tail[1..tail.len() - 1]));
        }
    }
    (text, None)
}
