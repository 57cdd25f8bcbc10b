use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::correlator::PendingResponse;
use super::error::SessionError;
use super::Session;
use crate::metrics;
use crate::protocol::{Payload, StreamKind, StreamStop};

/// Why a stream stopped delivering data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Stopped through [`StreamHandle::close`].
    Stopped,
    /// The peer refused to start the stream.
    Rejected(String),
    /// The session closed underneath the stream.
    ConnectionClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(Bytes),
    Closed(CloseReason),
}

pub type Consumer = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// What happened to one inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered { consumers: usize },
    /// Held for the single retry.
    Parked,
    Dropped,
}

enum Route {
    Deliver(Vec<Consumer>),
    Parked { first: bool },
    Full,
}

/// Upper bound on payloads held for a retry across all streams.
const MAX_PARKED: usize = 1024;

struct StreamEntry {
    kind: StreamKind,
    consumers: Vec<Consumer>,
}

struct RegistryState {
    next_id: i32,
    streams: HashMap<i32, StreamEntry>,
    parked: HashMap<i32, Vec<Bytes>>,
    parked_total: usize,
    closed: bool,
}

/// Open streams of one session and their consumers.
#[derive(Clone)]
pub struct StreamRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                next_id: 1,
                streams: HashMap::new(),
                parked: HashMap::new(),
                parked_total: 0,
                closed: false,
            })),
        }
    }

    /// Allocates a locally unique stream id with no consumers.
    pub fn open(&self, kind: StreamKind) -> Result<i32, SessionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SessionError::ConnectionClosed);
        }
        let id = loop {
            let id = state.next_id;
            state.next_id = id.checked_add(1).unwrap_or(1);
            if !state.streams.contains_key(&id) {
                break id;
            }
        };
        state.streams.insert(
            id,
            StreamEntry {
                kind,
                consumers: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Appends a consumer. Returns false if the stream is gone.
    pub fn register(&self, id: i32, consumer: Consumer) -> bool {
        match self.state.lock().streams.get_mut(&id) {
            Some(entry) => {
                entry.consumers.push(consumer);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: i32) -> bool {
        self.state.lock().streams.contains_key(&id)
    }

    pub fn kind(&self, id: i32) -> Option<StreamKind> {
        self.state.lock().streams.get(&id).map(|entry| entry.kind.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the stream and tells its consumers why.
    pub fn finish(&self, id: i32, reason: CloseReason) -> bool {
        let entry = self.state.lock().streams.remove(&id);
        match entry {
            Some(entry) => {
                let event = StreamEvent::Closed(reason);
                for consumer in &entry.consumers {
                    consumer(&event);
                }
                true
            }
            None => false,
        }
    }

    /// Delivers `data` to every consumer of `id` in registration order.
    ///
    /// A payload for an unknown stream is parked and retried once after
    /// `retry_delay` on a separate task, so the caller never waits. Later
    /// payloads for a stream with parked data queue behind it.
    pub fn dispatch(&self, id: i32, data: Bytes, retry_delay: Duration) -> Dispatch {
        let route = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(queue) = state.parked.get_mut(&id) {
                if state.parked_total < MAX_PARKED {
                    queue.push(data.clone());
                    state.parked_total += 1;
                    Route::Parked { first: false }
                } else {
                    Route::Full
                }
            } else if let Some(entry) = state.streams.get(&id) {
                Route::Deliver(entry.consumers.clone())
            } else if state.closed || state.parked_total >= MAX_PARKED {
                Route::Full
            } else {
                state.parked.insert(id, vec![data.clone()]);
                state.parked_total += 1;
                Route::Parked { first: true }
            }
        };

        match route {
            Route::Deliver(consumers) => {
                let event = StreamEvent::Data(data);
                for consumer in &consumers {
                    consumer(&event);
                }
                metrics::record_stream_payload("delivered");
                Dispatch::Delivered {
                    consumers: consumers.len(),
                }
            }
            Route::Parked { first } => {
                metrics::record_stream_payload("parked");
                if first {
                    self.schedule_retry(id, retry_delay);
                }
                Dispatch::Parked
            }
            Route::Full => {
                metrics::record_stream_payload("dropped");
                tracing::warn!(
                    target = "sandpolis::streams",
                    stream_id = id,
                    "dropping data for unknown stream; retry queue is full"
                );
                Dispatch::Dropped
            }
        }
    }

    /// Payloads waiting for their retry.
    pub fn parked(&self) -> usize {
        self.state.lock().parked_total
    }

    fn schedule_retry(&self, id: i32, delay: Duration) {
        let registry = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    registry.flush(id);
                });
            }
            Err(_) => registry.flush(id),
        }
    }

    /// Delivers or drops everything parked for `id`. The parked entry stays
    /// in place until drained so payloads arriving meanwhile keep their
    /// order.
    fn flush(&self, id: i32) {
        loop {
            let (batch, consumers) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let Some(queue) = state.parked.get_mut(&id) else {
                    return;
                };
                if queue.is_empty() {
                    state.parked.remove(&id);
                    return;
                }
                let batch = std::mem::take(queue);
                state.parked_total -= batch.len();
                let consumers = state.streams.get(&id).map(|entry| entry.consumers.clone());
                (batch, consumers)
            };

            match consumers {
                Some(consumers) => {
                    for data in batch {
                        let event = StreamEvent::Data(data);
                        for consumer in &consumers {
                            consumer(&event);
                        }
                        metrics::record_stream_payload("delivered_after_retry");
                    }
                }
                None => {
                    for _ in 0..batch.len() {
                        metrics::record_stream_payload("dropped");
                    }
                    tracing::warn!(
                        target = "sandpolis::streams",
                        stream_id = id,
                        payloads = batch.len(),
                        "dropping data for unknown stream"
                    );
                }
            }
        }
    }

    /// Closes every stream with `ConnectionClosed` and refuses new ones.
    pub fn close_all(&self) -> usize {
        let entries: Vec<(i32, StreamEntry)> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.parked.clear();
            state.parked_total = 0;
            state.streams.drain().collect()
        };
        let event = StreamEvent::Closed(CloseReason::ConnectionClosed);
        for (id, entry) in &entries {
            tracing::debug!(
                target = "sandpolis::streams",
                stream_id = id,
                kind = entry.kind.label(),
                "closing stream with session"
            );
            for consumer in &entry.consumers {
                consumer(&event);
            }
        }
        entries.len()
    }
}

/// Caller-side handle to an open stream.
///
/// The id is allocated locally, so the handle exists before the peer has
/// acknowledged the start request; await [`StreamHandle::started`] for that.
pub struct StreamHandle {
    id: i32,
    kind: StreamKind,
    session: Session,
    start: Mutex<Option<PendingResponse>>,
}

impl StreamHandle {
    pub(crate) fn new(id: i32, kind: StreamKind, session: Session, start: PendingResponse) -> Self {
        Self {
            id,
            kind,
            session,
            start: Mutex::new(Some(start)),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }

    pub fn is_open(&self) -> bool {
        self.session.streams().contains(self.id)
    }

    /// Adds a consumer that runs on the session reader.
    pub fn register<F>(&self, consumer: F) -> bool
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.session.streams().register(self.id, Arc::new(consumer))
    }

    /// Adds a consumer that runs on the session's callback executor.
    pub fn register_deferred<F>(&self, consumer: F) -> bool
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        let executor = self.session.executor();
        let consumer = Arc::new(consumer);
        self.register(move |event: &StreamEvent| {
            let consumer = Arc::clone(&consumer);
            let event = event.clone();
            executor.execute(Box::new(move || consumer(event)));
        })
    }

    /// Waits for the peer to acknowledge the start request. A refusal
    /// removes the stream.
    pub async fn started(&self) -> Result<(), SessionError> {
        let pending = self.start.lock().take();
        let Some(pending) = pending else {
            return Ok(());
        };
        let result = match pending.await {
            Ok(message) => match message.payload {
                Payload::Outcome(outcome) if outcome.ok => Ok(()),
                Payload::Outcome(outcome) => Err(SessionError::Rejected(outcome.message)),
                other => Err(SessionError::UnexpectedResponse {
                    expected: "outcome",
                    received: other.name(),
                }),
            },
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            let reason = match err {
                SessionError::Rejected(message) => CloseReason::Rejected(message.clone()),
                _ => CloseReason::Rejected(err.to_string()),
            };
            self.session.streams().finish(self.id, reason);
        }
        result
    }

    /// Stops the stream at the peer and removes it locally.
    pub async fn close(self) -> Result<(), SessionError> {
        self.session.close_stream(&self).await
    }
}

/// A handle dropped without [`StreamHandle::close`] removes the stream
/// locally and sends the peer a stop without waiting for its answer.
impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !self.session.streams().finish(self.id, CloseReason::Stopped) {
            return;
        }
        let stream_id = self.id;
        let stop = Payload::StreamStop(StreamStop { stream_id });
        let Ok(pending) = self.session.request(stop) else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = pending.await {
                    tracing::debug!(
                        target = "sandpolis::streams",
                        stream_id,
                        error = %err,
                        "stop for dropped stream failed"
                    );
                }
            });
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn recorder() -> (Arc<PlMutex<Vec<String>>>, impl Fn(&'static str) -> Consumer) {
        let log = Arc::new(PlMutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &'static str| -> Consumer {
            let sink = sink.clone();
            Arc::new(move |event: &StreamEvent| {
                let entry = match event {
                    StreamEvent::Data(data) => format!("{name}:{}", data.len()),
                    StreamEvent::Closed(reason) => format!("{name}:{reason:?}"),
                };
                sink.lock().push(entry);
            })
        };
        (log, make)
    }

    const RETRY: Duration = Duration::from_millis(100);

    #[test_timeout::tokio_timeout_test]
    async fn fan_out_follows_registration_order() {
        let registry = StreamRegistry::new();
        let id = registry.open(StreamKind::ProfileEvents).unwrap();
        let (log, consumer) = recorder();
        for name in ["first", "second", "third"] {
            assert!(registry.register(id, consumer(name)));
        }

        let result = registry.dispatch(id, Bytes::from_static(b"abcd"), RETRY);
        assert_eq!(result, Dispatch::Delivered { consumers: 3 });
        assert_eq!(*log.lock(), vec!["first:4", "second:4", "third:4"]);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn late_registration_is_caught_by_the_retry() {
        let registry = StreamRegistry::new();
        let (log, consumer) = recorder();

        assert_eq!(
            registry.dispatch(1, Bytes::from_static(b"x"), RETRY),
            Dispatch::Parked
        );
        let id = registry.open(StreamKind::Shell).unwrap();
        assert_eq!(id, 1);
        registry.register(id, consumer("late"));
        // queued behind the parked payload even though the stream now exists
        assert_eq!(
            registry.dispatch(1, Bytes::from_static(b"yy"), RETRY),
            Dispatch::Parked
        );
        assert!(log.lock().is_empty());

        tokio::time::sleep(RETRY * 2).await;
        assert_eq!(*log.lock(), vec!["late:1", "late:2"]);
        assert_eq!(registry.parked(), 0);
        assert_eq!(
            registry.dispatch(1, Bytes::from_static(b"zzz"), RETRY),
            Dispatch::Delivered { consumers: 1 }
        );
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn unknown_stream_is_dropped_after_one_retry() {
        let registry = StreamRegistry::new();
        let started = tokio::time::Instant::now();
        assert_eq!(
            registry.dispatch(77, Bytes::from_static(b"x"), RETRY),
            Dispatch::Parked
        );
        // dispatch itself never waits
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(registry.parked(), 1);

        tokio::time::sleep(RETRY * 2).await;
        assert_eq!(registry.parked(), 0);
        let id = registry.open(StreamKind::Shell).unwrap();
        let (log, consumer) = recorder();
        registry.register(id, consumer("s"));
        assert!(log.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn retry_queue_is_bounded() {
        let registry = StreamRegistry::new();
        for n in 0..MAX_PARKED {
            let id = i32::try_from(n).unwrap() + 1000;
            assert_eq!(
                registry.dispatch(id, Bytes::from_static(b"x"), RETRY),
                Dispatch::Parked
            );
        }
        assert_eq!(
            registry.dispatch(5, Bytes::from_static(b"x"), RETRY),
            Dispatch::Dropped
        );
        tokio::time::sleep(RETRY * 2).await;
        assert_eq!(registry.parked(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn consumer_may_register_during_dispatch() {
        let registry = StreamRegistry::new();
        let id = registry.open(StreamKind::StateSync).unwrap();
        let inner = registry.clone();
        let (log, consumer) = recorder();
        let added = consumer("added");
        registry.register(
            id,
            Arc::new(move |_event: &StreamEvent| {
                inner.register(id, added.clone());
            }),
        );

        registry.dispatch(id, Bytes::from_static(b"1"), Duration::ZERO);
        assert!(log.lock().is_empty());
        registry.dispatch(id, Bytes::from_static(b"2"), Duration::ZERO);
        assert_eq!(*log.lock(), vec!["added:1"]);
    }

    #[test_timeout::timeout]
    fn close_all_notifies_and_empties() {
        let registry = StreamRegistry::new();
        let (log, consumer) = recorder();
        let a = registry.open(StreamKind::StateSync).unwrap();
        let b = registry.open(StreamKind::Screenshot).unwrap();
        registry.register(a, consumer("a"));
        registry.register(b, consumer("b"));

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a:ConnectionClosed", "b:ConnectionClosed"]);
        assert!(matches!(
            registry.open(StreamKind::Shell),
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[test_timeout::timeout]
    fn finish_removes_single_stream() {
        let registry = StreamRegistry::new();
        let (log, consumer) = recorder();
        let id = registry.open(StreamKind::StateSync).unwrap();
        registry.register(id, consumer("s"));
        assert!(registry.finish(id, CloseReason::Stopped));
        assert!(!registry.finish(id, CloseReason::Stopped));
        assert_eq!(*log.lock(), vec!["s:Stopped"]);
        assert!(!registry.register(id, consumer("late")));
    }
}
