use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use super::error::SessionError;
use super::{RequestHandler, SessionIdentity};
use crate::protocol::{Message, Payload, UNCORRELATED};

/// Hands out connection ids on the server side, from `first` up to
/// `i32::MAX` and then around again to `first`. Ids below `first` are never
/// handed out.
#[derive(Debug)]
pub struct CvidAllocator {
    next: AtomicI32,
    first: i32,
}

impl Default for CvidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CvidAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: i32) -> Self {
        debug_assert!(first > UNCORRELATED, "cvids are positive");
        let first = first.max(1);
        Self {
            next: AtomicI32::new(first),
            first,
        }
    }

    pub fn allocate(&self) -> i32 {
        let first = self.first;
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.checked_add(1).unwrap_or(first))
            })
            .unwrap_or_else(|current| current)
    }
}

pub const SERVER_CVID: i32 = 1;

/// Shared by every session a server accepts.
#[derive(Clone)]
pub struct ServerContext {
    allocator: Arc<CvidAllocator>,
    local_cvid: i32,
    handler: Arc<dyn RequestHandler>,
}

impl ServerContext {
    /// The server keeps [`SERVER_CVID`]; clients get the ids above it.
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        let local_cvid = SERVER_CVID;
        let allocator = Arc::new(CvidAllocator::starting_at(local_cvid + 1));
        Self {
            allocator,
            local_cvid,
            handler,
        }
    }

    pub fn local_cvid(&self) -> i32 {
        self.local_cvid
    }

    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        Arc::clone(&self.handler)
    }

    pub(crate) fn allocator(&self) -> Arc<CvidAllocator> {
        Arc::clone(&self.allocator)
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("local_cvid", &self.local_cvid)
            .finish()
    }
}

pub(crate) type Identified = oneshot::Sender<Result<SessionIdentity, SessionError>>;

/// Single-use handshake hook owned by the session reader. It fires for the
/// first matching message and is then dropped.
pub(crate) enum Handshake {
    Client {
        request_id: i32,
        done: Identified,
    },
    Server {
        allocator: Arc<CvidAllocator>,
        local_cvid: i32,
        done: Identified,
    },
}

impl Handshake {
    pub(crate) fn accepts(&self, message: &Message) -> bool {
        match self {
            Handshake::Client { request_id, .. } => {
                message.id == *request_id && matches!(message.payload, Payload::IdentityResponse(_))
            }
            Handshake::Server { .. } => matches!(message.payload, Payload::IdentityRequest(_)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IdentityResponse, Outcome};
    use uuid::Uuid;

    #[test_timeout::timeout]
    fn allocator_wraps_to_its_first_id() {
        let allocator = CvidAllocator::new();
        assert_eq!(allocator.allocate(), 1);
        assert_eq!(allocator.allocate(), 2);
        allocator.next.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(allocator.allocate(), i32::MAX);
        assert_eq!(allocator.allocate(), 1);
    }

    #[test_timeout::timeout]
    fn server_cvid_is_never_handed_to_a_client() {
        let context = ServerContext::new(Arc::new(crate::session::RejectRequests));
        let allocator = context.allocator();
        assert_eq!(context.local_cvid(), SERVER_CVID);
        assert_eq!(allocator.allocate(), SERVER_CVID + 1);
        allocator.next.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(allocator.allocate(), i32::MAX);
        assert_eq!(allocator.allocate(), SERVER_CVID + 1);
    }

    #[test_timeout::timeout]
    fn client_hook_matches_only_its_response() {
        let (done, _rx) = oneshot::channel();
        let hook = Handshake::Client {
            request_id: 4,
            done,
        };
        let response = Payload::IdentityResponse(IdentityResponse {
            cvid: 42,
            server_cvid: 1,
            server_uuid: Uuid::nil(),
        });
        assert!(hook.accepts(&Message::new(4, response.clone())));
        assert!(!hook.accepts(&Message::new(5, response)));
        assert!(!hook.accepts(&Message::new(4, Payload::Outcome(Outcome::success()))));
    }
}
