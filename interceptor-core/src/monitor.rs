//! Live observation worker
//!
//! Reads trace text, turns it into [`TrafficEvent`]s and publishes them on the
//! [`EventBus`]. A response is held back until its body preview is complete:
//! indented lines are folded into it, and it is published on the next blank
//! line, the next event, a short idle period, or the end of input.

use crate::bus::EventBus;
use crate::event::{ResponseObserved, TrafficEvent};
use crate::parser::{self, EMPTY_BODY_MARKER};
use std::io;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a response waits for more preview lines before it is published
pub const PENDING_FLUSH_AFTER: Duration = Duration::from_millis(250);

/// Why the monitor stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// The feed reached end of input
    StreamClosed,
    /// Reading the feed failed
    StreamFailed(String),
    /// The cancellation token fired
    Stopped,
}

#[derive(Debug)]
struct PendingResponse {
    event: ResponseObserved,
    preview: Vec<String>,
    empty_body: bool,
}

impl PendingResponse {
    fn finish(self) -> TrafficEvent {
        let mut event = self.event;
        event.body_preview = if self.empty_body {
            Some(String::new())
        } else if self.preview.is_empty() {
            None
        } else {
            Some(self.preview.join("\n"))
        };
        TrafficEvent::Response(event)
    }
}

#[derive(Debug, Default)]
struct LineCounts {
    lines: u64,
    published: u64,
    skipped: u64,
}

/// Worker feeding one trace stream into the bus
#[derive(Debug, Clone)]
pub struct TrafficMonitor {
    bus: EventBus,
    cancel: CancellationToken,
}

impl TrafficMonitor {
    pub fn new(bus: EventBus, cancel: CancellationToken) -> Self {
        Self { bus, cancel }
    }

    /// Run the monitor on its own task
    pub fn spawn<S>(self, feed: S) -> JoinHandle<MonitorExit>
    where
        S: Stream<Item = io::Result<String>> + Send + 'static,
    {
        tokio::spawn(self.run(feed))
    }

    /// Consume `feed` until it ends, fails or the token is cancelled.
    ///
    /// Each item may hold several newline separated lines. The session is
    /// marked as stopped on every exit path.
    pub async fn run<S>(self, feed: S) -> MonitorExit
    where
        S: Stream<Item = io::Result<String>>,
    {
        tokio::pin!(feed);
        let mut pending: Option<PendingResponse> = None;
        let mut counts = LineCounts::default();
        info!("Traffic monitor started");

        let exit = loop {
            let waiting = pending.is_some();
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break MonitorExit::Stopped,
                _ = idle(waiting) => {
                    self.flush(&mut pending, &mut counts);
                    continue;
                }
                item = feed.next() => item,
            };

            match item {
                Some(Ok(chunk)) => {
                    for line in chunk.split('\n') {
                        self.handle_line(line, &mut pending, &mut counts);
                    }
                }
                Some(Err(e)) => {
                    warn!("Traffic feed failed: {}", e);
                    break MonitorExit::StreamFailed(e.to_string());
                }
                None => break MonitorExit::StreamClosed,
            }
        };

        self.flush(&mut pending, &mut counts);
        self.bus.end_session();
        info!(
            "Traffic monitor exited ({:?}): {} lines, {} events, {} skipped",
            exit, counts.lines, counts.published, counts.skipped
        );
        exit
    }

    fn handle_line(
        &self,
        raw: &str,
        pending: &mut Option<PendingResponse>,
        counts: &mut LineCounts,
    ) {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        counts.lines += 1;

        if let Some(response) = pending.as_mut() {
            if let Some(text) = parser::continuation(line) {
                if text.trim() == EMPTY_BODY_MARKER && response.preview.is_empty() {
                    response.empty_body = true;
                } else {
                    response.preview.push(text.to_string());
                }
                return;
            }
            if line.trim().is_empty() {
                self.flush(pending, counts);
                return;
            }
        }

        match parser::parse(line) {
            Ok(TrafficEvent::Response(event)) => {
                self.flush(pending, counts);
                *pending = Some(PendingResponse {
                    event,
                    preview: Vec::new(),
                    empty_body: false,
                });
            }
            Ok(event) => {
                self.flush(pending, counts);
                self.publish(event, counts);
            }
            Err(_) => {
                if !line.trim().is_empty() {
                    counts.skipped += 1;
                    debug!("Skipping trace line: {}", line);
                }
            }
        }
    }

    fn flush(&self, pending: &mut Option<PendingResponse>, counts: &mut LineCounts) {
        if let Some(response) = pending.take() {
            self.publish(response.finish(), counts);
        }
    }

    fn publish(&self, event: TrafficEvent, counts: &mut LineCounts) {
        counts.published += 1;
        self.bus.publish(event);
    }
}

async fn idle(waiting: bool) {
    if waiting {
        tokio::time::sleep(PENDING_FLUSH_AFTER).await;
    } else {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ProxyMode;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn feed(lines: &[&str]) -> impl Stream<Item = io::Result<String>> {
        tokio_stream::iter(
            lines
                .iter()
                .map(|line| Ok(line.to_string()))
                .collect::<Vec<_>>(),
        )
    }

    fn response(event: Option<TrafficEvent>) -> ResponseObserved {
        match event {
            Some(TrafficEvent::Response(res)) => res,
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_folds_body_preview_and_counts_requests() {
        let bus = EventBus::default();
        bus.begin_session(4545, ProxyMode::Minimal);
        let mut sub = bus.subscribe();

        let exit = TrafficMonitor::new(bus.clone(), CancellationToken::new())
            .run(feed(&[
                "[12:00:00] POST https://example.com/api [Chrome]",
                "[12:00:01] └─ Response: 201 application/json",
                "    {",
                "      \"id\": 1",
                "    }",
                "",
                "[12:00:02] GET https://example.com/next",
                "garbage",
            ]))
            .await;
        assert_eq!(exit, MonitorExit::StreamClosed);

        assert!(matches!(sub.recv().await, Some(TrafficEvent::Request(_))));
        let res = response(sub.recv().await);
        assert_eq!(res.status_code, 201);
        assert_eq!(res.body_preview.as_deref(), Some("{\n  \"id\": 1\n}"));
        assert!(matches!(sub.recv().await, Some(TrafficEvent::Request(_))));
        assert!(sub.try_recv().is_none());

        let state = bus.current_state();
        assert_eq!(state.requests_count, 2);
        assert!(!state.running);
    }

    #[tokio::test]
    async fn test_response_flushed_by_next_event_and_end_of_stream() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        TrafficMonitor::new(bus.clone(), CancellationToken::new())
            .run(feed(&[
                "[12:00:01] └─ Response: 200 text/plain",
                "    (empty response)",
                "[12:00:02] GET https://a.com/",
                "[12:00:03] └─ Response: 404 text/html",
            ]))
            .await;

        let first = response(sub.recv().await);
        assert_eq!(first.body_preview.as_deref(), Some(""));
        assert!(matches!(sub.recv().await, Some(TrafficEvent::Request(_))));
        let last = response(sub.recv().await);
        assert_eq!(last.status_code, 404);
        assert_eq!(last.body_preview, None);
    }

    #[tokio::test]
    async fn test_multi_line_chunks_are_split() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        TrafficMonitor::new(bus.clone(), CancellationToken::new())
            .run(feed(&["[12:00:01] └─ Response: 200 text/plain\n    ok\n"]))
            .await;

        let res = response(sub.recv().await);
        assert_eq!(res.body_preview.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_stream_error_ends_session() {
        let bus = EventBus::default();
        bus.begin_session(4545, ProxyMode::Minimal);
        let items: Vec<io::Result<String>> = vec![
            Ok("[12:00:00] GET https://a.com/".to_string()),
            Err(io::Error::new(io::ErrorKind::Other, "pipe closed")),
            Ok("[12:00:01] GET https://b.com/".to_string()),
        ];

        let exit = TrafficMonitor::new(bus.clone(), CancellationToken::new())
            .run(tokio_stream::iter(items))
            .await;

        assert_eq!(exit, MonitorExit::StreamFailed("pipe closed".to_string()));
        let state = bus.current_state();
        assert_eq!(state.requests_count, 1);
        assert!(!state.running);
    }

    #[tokio::test]
    async fn test_cancellation_stops_monitor() {
        let bus = EventBus::default();
        bus.begin_session(4545, ProxyMode::Minimal);
        let cancel = CancellationToken::new();

        let handle = TrafficMonitor::new(bus.clone(), cancel.clone())
            .spawn(tokio_stream::pending::<io::Result<String>>());
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), MonitorExit::Stopped);
        assert!(!bus.current_state().running);
    }

    #[tokio::test]
    async fn test_idle_response_is_flushed() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = TrafficMonitor::new(bus.clone(), cancel.clone())
            .spawn(ReceiverStream::new(rx).map(Ok::<_, io::Error>));

        tx.send("[12:00:01] └─ Response: 200 text/plain".to_string())
            .await
            .unwrap();
        tx.send("    done".to_string()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert_eq!(response(event).body_preview.as_deref(), Some("done"));

        drop(tx);
        assert_eq!(handle.await.unwrap(), MonitorExit::StreamClosed);
        assert!(!cancel.is_cancelled());
    }
}
