//! Process-wide fan-out of traffic events
//!
//! Every observer owns a bounded channel. `publish` never waits: when an
//! observer's channel is full the new event is dropped for that observer
//! only (and counted), and observers whose receiving side is gone are pruned.
//! Counter updates and fan-out happen under one lock, so a state snapshot
//! always agrees with what observers have been handed, and every observer sees
//! events in publish order.

use crate::event::TrafficEvent;
use crate::session::{ProxyMode, SessionState};
use chrono::Local;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Default per-observer buffer
pub const DEFAULT_OBSERVER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Receiving side of one observer registration
#[derive(Debug)]
pub struct Subscription {
    id: ObserverId,
    receiver: mpsc::Receiver<TrafficEvent>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next event; `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<TrafficEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TrafficEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<TrafficEvent> {
        ReceiverStream::new(self.receiver)
    }
}

#[derive(Debug)]
struct BusInner {
    observers: DashMap<ObserverId, mpsc::Sender<TrafficEvent>>,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,
    next_id: AtomicU64,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(SessionState::default(), DEFAULT_OBSERVER_CAPACITY)
    }
}

impl EventBus {
    pub fn new(initial: SessionState, observer_capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(BusInner {
                observers: DashMap::new(),
                state: Mutex::new(initial),
                state_tx,
                next_id: AtomicU64::new(1),
                capacity: observer_capacity.max(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an observer. Only events published from now on are delivered.
    pub fn subscribe(&self) -> Subscription {
        let id = ObserverId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.observers.insert(id, tx);
        debug!("Observer {:?} subscribed", id);
        Subscription { id, receiver: rx }
    }

    /// Remove an observer. Returns whether it was still registered; calling
    /// it again is a no-op.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let removed = self.inner.observers.remove(&id).is_some();
        if removed {
            debug!("Observer {:?} unsubscribed", id);
        }
        removed
    }

    /// Count the event and hand it to every registered observer.
    ///
    /// Returns how many observers accepted it.
    pub fn publish(&self, event: TrafficEvent) -> usize {
        let mut state = self.lock_state();
        if event.is_request() {
            state.requests_count += 1;
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        for observer in self.inner.observers.iter() {
            match observer.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Observer {:?} is full, dropping event", observer.key());
                }
                Err(TrySendError::Closed(_)) => closed.push(*observer.key()),
            }
        }
        for id in closed {
            self.inner.observers.remove(&id);
            debug!("Observer {:?} disconnected, removed", id);
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        if event.is_request() {
            self.inner.state_tx.send_replace(state.clone());
        }
        delivered
    }

    pub fn current_state(&self) -> SessionState {
        self.lock_state().clone()
    }

    /// Receiver notified on every session state change
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Mark a new session as running and reset its counters
    pub fn begin_session(&self, port: u16, mode: ProxyMode) {
        let mut state = self.lock_state();
        *state = SessionState {
            requests_count: 0,
            running: true,
            start_time: Some(Local::now()),
            port,
            mode,
        };
        info!("Session started on port {} ({} mode)", port, mode);
        self.inner.state_tx.send_replace(state.clone());
    }

    /// Mark the session as stopped; the request count is kept for inspection
    pub fn end_session(&self) {
        let mut state = self.lock_state();
        if !state.running {
            return;
        }
        state.running = false;
        state.start_time = None;
        info!("Session stopped after {} requests", state.requests_count);
        self.inner.state_tx.send_replace(state.clone());
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Events dropped because an observer's buffer was full
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RequestObserved, ResponseObserved};

    fn request(n: usize) -> TrafficEvent {
        TrafficEvent::Request(RequestObserved {
            timestamp: "12:00:00".to_string(),
            method: "GET".to_string(),
            url: format!("https://example.com/{}", n),
            host: "example.com".to_string(),
            path: format!("/{}", n),
            client_label: None,
            id: "12:00:00_GET_example.com".to_string(),
            matched_rule: None,
        })
    }

    fn response(status: u16) -> TrafficEvent {
        TrafficEvent::Response(ResponseObserved {
            timestamp: "12:00:01".to_string(),
            status_code: status,
            content_type: String::new(),
            body_preview: None,
        })
    }

    #[tokio::test]
    async fn test_responses_do_not_count() {
        let bus = EventBus::default();
        for n in 0..5 {
            bus.publish(request(n));
        }
        for _ in 0..3 {
            bus.publish(response(200));
        }
        assert_eq!(bus.current_state().requests_count, 5);
        assert_eq!(bus.published_count(), 8);
    }

    #[tokio::test]
    async fn test_publish_without_observers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(request(0)), 0);
        assert_eq!(bus.current_state().requests_count, 1);
    }

    #[tokio::test]
    async fn test_observer_sees_publish_order() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(request(1));
        bus.publish(response(201));
        bus.publish(request(2));

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.recv().await, Some(request(1)));
            assert_eq!(sub.recv().await, Some(response(201)));
            assert_eq!(sub.recv().await, Some(request(2)));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_history() {
        let bus = EventBus::default();
        bus.publish(request(1));
        let mut late = bus.subscribe();
        assert!(late.try_recv().is_none());
        bus.publish(request(2));
        assert_eq!(late.recv().await, Some(request(2)));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        assert_eq!(bus.observer_count(), 1);
        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
        assert_eq!(bus.observer_count(), 0);

        bus.publish(request(1));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_full_observer_drops_new_events_without_blocking() {
        let bus = EventBus::new(SessionState::default(), 2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for n in 0..3 {
            bus.publish(request(n));
            // Keep the fast observer drained
            assert_eq!(fast.recv().await, Some(request(n)));
        }

        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(slow.recv().await, Some(request(0)));
        assert_eq!(slow.recv().await, Some(request(1)));
        assert!(slow.try_recv().is_none());
        assert_eq!(bus.current_state().requests_count, 3);
    }

    #[tokio::test]
    async fn test_disconnected_observer_is_pruned() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        let _kept = bus.subscribe();
        drop(sub);
        assert_eq!(bus.publish(request(0)), 1);
        assert_eq!(bus.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_state_consistent_with_deliveries() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        bus.publish(request(0));
        bus.publish(response(200));
        bus.publish(request(1));

        let state = bus.current_state();
        let mut delivered_requests = 0;
        while let Some(event) = sub.try_recv() {
            if event.is_request() {
                delivered_requests += 1;
            }
        }
        assert_eq!(state.requests_count, delivered_requests);
    }

    #[tokio::test]
    async fn test_session_lifecycle_is_watched() {
        let bus = EventBus::default();
        let mut watcher = bus.watch_state();

        bus.begin_session(8081, ProxyMode::Verbose);
        watcher.changed().await.unwrap();
        let state = watcher.borrow_and_update().clone();
        assert!(state.running);
        assert_eq!(state.port, 8081);
        assert_eq!(state.mode, ProxyMode::Verbose);
        assert!(state.start_time.is_some());

        bus.publish(request(0));
        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow_and_update().requests_count, 1);

        bus.end_session();
        watcher.changed().await.unwrap();
        let state = watcher.borrow_and_update().clone();
        assert!(!state.running);
        assert!(state.start_time.is_none());
        assert_eq!(state.requests_count, 1);

        // Restarting resets the counter
        bus.begin_session(8081, ProxyMode::Minimal);
        assert_eq!(bus.current_state().requests_count, 0);
    }

    #[test]
    fn test_concurrent_publishers_deliver_everything() {
        let bus = EventBus::new(SessionState::default(), 10_000);
        let mut sub = bus.subscribe();

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for n in 0..250 {
                        bus.publish(request(n));
                        bus.publish(response(200));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 2000);
        assert_eq!(bus.current_state().requests_count, 1000);
        assert_eq!(bus.dropped_count(), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn request_count_ignores_responses(kinds in proptest::collection::vec(any::<bool>(), 0..200)) {
                let bus = EventBus::new(SessionState::default(), 512);
                let mut sub = bus.subscribe();
                for (n, is_request) in kinds.iter().enumerate() {
                    if *is_request {
                        bus.publish(request(n));
                    } else {
                        bus.publish(response(200));
                    }
                }
                let expected = kinds.iter().filter(|k| **k).count() as u64;
                prop_assert_eq!(bus.current_state().requests_count, expected);

                let mut seen = Vec::new();
                while let Some(event) = sub.try_recv() {
                    seen.push(event.is_request());
                }
                prop_assert_eq!(seen, kinds);
            }
        }
    }
}
