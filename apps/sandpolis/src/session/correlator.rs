use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error::SessionError;
use crate::metrics;
use crate::protocol::{Message, UNCORRELATED};

type Waiter = oneshot::Sender<Result<Message, SessionError>>;

struct Pending {
    generation: u64,
    waiter: Waiter,
}

struct State {
    next_id: i32,
    next_generation: u64,
    pending: HashMap<i32, Pending>,
    closed: bool,
}

/// Pending-request table for one session.
///
/// Every entry resolves exactly once: by a matching response, by its
/// deadline, or by [`Correlator::close`]. All table access happens under a
/// single lock so registration and resolution cannot interleave.
#[derive(Clone)]
pub struct Correlator {
    state: Arc<Mutex<State>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_id: 1,
                next_generation: 0,
                pending: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Allocates a request id not currently pending. Ids wrap and skip zero.
    pub fn next_id(&self) -> i32 {
        let mut state = self.state.lock();
        loop {
            let id = state.next_id;
            state.next_id = match id.checked_add(1) {
                Some(next) => next,
                None => 1,
            };
            if id != UNCORRELATED && !state.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Installs a waiter for `id`. A zero `timeout` waits indefinitely.
    ///
    /// An entry already registered under `id` is failed with
    /// [`SessionError::Superseded`] before the new one is installed.
    pub fn register(&self, id: i32, timeout: Duration) -> Result<PendingResponse, SessionError> {
        let (waiter, receiver) = oneshot::channel();
        let generation = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SessionError::ConnectionClosed);
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            if let Some(stale) = state.pending.insert(id, Pending { generation, waiter }) {
                tracing::warn!(
                    target = "sandpolis::correlator",
                    request_id = id,
                    "request id re-registered before it resolved"
                );
                metrics::record_request("superseded");
                let _ = stale.waiter.send(Err(SessionError::Superseded { id }));
            }
            generation
        };

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        Ok(PendingResponse {
            id,
            generation,
            deadline,
            receiver: Some(receiver),
            correlator: self.clone(),
        })
    }

    /// Completes the waiter for `message.id`. Returns the message back when
    /// nothing is pending under that id.
    pub fn resolve(&self, message: Message) -> Result<(), Message> {
        let entry = self.state.lock().pending.remove(&message.id);
        match entry {
            Some(pending) => {
                metrics::record_request("ok");
                // the caller may have stopped waiting
                let _ = pending.waiter.send(Ok(message));
                Ok(())
            }
            None => Err(message),
        }
    }

    pub fn contains(&self, id: i32) -> bool {
        self.state.lock().pending.contains_key(&id)
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Fails every pending entry with `ConnectionClosed` and refuses new ones.
    pub fn close(&self) -> usize {
        let drained: Vec<Pending> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain().map(|(_, pending)| pending).collect()
        };
        let count = drained.len();
        for pending in drained {
            metrics::record_request("closed");
            let _ = pending.waiter.send(Err(SessionError::ConnectionClosed));
        }
        count
    }

    /// Removes the entry for `id` if it still belongs to `generation`.
    fn remove(&self, id: i32, generation: u64) -> bool {
        let mut state = self.state.lock();
        match state.pending.get(&id) {
            Some(pending) if pending.generation == generation => {
                state.pending.remove(&id);
                true
            }
            _ => false,
        }
    }
}

/// Handle to one registered request. Await it for the response; dropping it
/// withdraws the request.
pub struct PendingResponse {
    id: i32,
    generation: u64,
    deadline: Option<Instant>,
    receiver: Option<oneshot::Receiver<Result<Message, SessionError>>>,
    correlator: Correlator,
}

impl PendingResponse {
    pub fn id(&self) -> i32 {
        self.id
    }

    async fn wait(mut self) -> Result<Message, SessionError> {
        let Some(mut receiver) = self.receiver.take() else {
            return Err(SessionError::ConnectionClosed);
        };
        let outcome = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if self.correlator.remove(self.id, self.generation) {
                        metrics::record_request("timeout");
                        tracing::debug!(
                            target = "sandpolis::correlator",
                            request_id = self.id,
                            "request timed out"
                        );
                        return Err(SessionError::RequestTimeout { id: self.id });
                    }
                    // resolved concurrently with the deadline
                    receiver.await
                }
            },
            None => receiver.await,
        };
        outcome.unwrap_or(Err(SessionError::ConnectionClosed))
    }
}

impl IntoFuture for PendingResponse {
    type Output = Result<Message, SessionError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.correlator.remove(self.id, self.generation) {
            metrics::record_request("cancelled");
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish()
    }
}
