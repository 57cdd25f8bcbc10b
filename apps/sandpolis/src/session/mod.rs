//! One logical connection to a peer.
//!
//! A [`Session`] owns a reader task that drains frames in wire order and a
//! writer task that frames outbound bodies. Responses are matched to
//! requests through the [`Correlator`], stream data is fanned out through
//! the [`StreamRegistry`], and every other request goes to the session's
//! [`RequestHandler`]. Teardown fails everything still waiting.

pub mod correlator;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod streams;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use state_tree::codec as record_codec;
use state_tree::{InstanceFlavor, InstanceType, Oid, StateTree, UpdateRecord};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth;
use crate::metrics;
use crate::protocol::{
    decode_message, encode_message, IdentityRequest, IdentityResponse, LoginRequest, Message,
    Outcome, Payload, PayloadRole, SnapshotRequest, StreamKind, StreamStart, StreamStop,
    UpdatePush, UNCORRELATED,
};
use crate::telemetry;
use crate::transport::{self, AsyncStream, FrameReader, FrameWriter, TlsPolicy, DEFAULT_MAX_FRAME_LEN};

pub use correlator::{Correlator, PendingResponse};
pub use error::{ErrorCategory, SessionError};
pub use executor::{CallbackExecutor, InlineExecutor, TokioExecutor};
pub use handshake::{CvidAllocator, ServerContext, SERVER_CVID};
pub use streams::{CloseReason, Consumer, Dispatch, StreamEvent, StreamHandle, StreamRegistry};

use handshake::{Handshake, Identified};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport connect in progress; a [`Session`] starts in `Handshaking`.
    Connecting,
    Handshaking,
    Established,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Both ends' identities, fixed by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdentity {
    pub cvid: i32,
    pub peer_cvid: i32,
    pub peer_uuid: Uuid,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub instance_type: InstanceType,
    pub instance_flavor: InstanceFlavor,
    pub uuid: Uuid,
    /// Namespace of the session's state tree.
    pub namespace: String,
    /// Applied by [`Session::request`]. Zero waits indefinitely.
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Delay before the single retry of stream data for an unknown stream.
    pub retry_delay: Duration,
    pub max_frame_len: usize,
    pub executor: Arc<dyn CallbackExecutor>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instance_type: InstanceType::Client,
            instance_flavor: InstanceFlavor::Terminal,
            uuid: Uuid::new_v4(),
            namespace: String::new(),
            request_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(100),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            executor: Arc::new(TokioExecutor::default()),
        }
    }
}

impl SessionConfig {
    pub fn server() -> Self {
        Self {
            instance_type: InstanceType::Server,
            instance_flavor: InstanceFlavor::Standard,
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CallbackExecutor>) -> Self {
        self.executor = executor;
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("instance_type", &self.instance_type)
            .field("instance_flavor", &self.instance_flavor)
            .field("uuid", &self.uuid)
            .field("namespace", &self.namespace)
            .field("request_timeout", &self.request_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("retry_delay", &self.retry_delay)
            .field("max_frame_len", &self.max_frame_len)
            .finish()
    }
}

/// Answers requests the peer sends on a session.
///
/// `handle` runs on the session reader, so nothing else is read from the
/// connection until it returns. It must not await a response from the same
/// session.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Returns the reply payload, or `None` to send nothing.
    async fn handle(&self, session: &Session, request: &Message) -> Option<Payload>;

    /// Called once when the session shuts down.
    async fn closed(&self, _session: &Session) {}
}

/// Refuses every request. Default handler for client sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectRequests;

#[async_trait]
impl RequestHandler for RejectRequests {
    async fn handle(&self, _session: &Session, request: &Message) -> Option<Payload> {
        Some(Payload::Outcome(Outcome::failure(format!(
            "{} is not supported",
            request.payload.name()
        ))))
    }
}

#[derive(Debug, Clone)]
enum CloseCause {
    Local,
    PeerClosed,
    Transport(String),
    Handshake(String),
}

impl CloseCause {
    fn label(&self) -> &'static str {
        match self {
            CloseCause::Local => "local_close",
            CloseCause::PeerClosed => "peer_closed",
            CloseCause::Transport(_) => "transport_error",
            CloseCause::Handshake(_) => "handshake_failed",
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::Local => f.write_str("closed locally"),
            CloseCause::PeerClosed => f.write_str("peer closed the connection"),
            CloseCause::Transport(reason) => write!(f, "transport error: {reason}"),
            CloseCause::Handshake(reason) => write!(f, "handshake failed: {reason}"),
        }
    }
}

struct Inner {
    role: Role,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    identity: RwLock<Option<SessionIdentity>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    correlator: Correlator,
    streams: StreamRegistry,
    tree: Arc<StateTree>,
    handler: Arc<dyn RequestHandler>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // every handle is gone without a close; still fail whatever waits
        let state = *self.state.borrow();
        if !state.is_terminal() {
            self.correlator.close();
            self.streams.close_all();
            if state == SessionState::Established {
                metrics::OPEN_SESSIONS.dec();
            }
            metrics::record_session(self.role.label(), "dropped");
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Connects to `address:port` and completes the client handshake.
    pub async fn connect(
        address: &str,
        port: u16,
        tls: &TlsPolicy,
        config: SessionConfig,
    ) -> Result<Session, SessionError> {
        let io = transport::connect(address, port, tls).await?;
        Self::establish(io, config).await
    }

    /// Runs the client handshake over an already connected stream.
    pub async fn establish<S: AsyncStream>(io: S, config: SessionConfig) -> Result<Session, SessionError> {
        Self::establish_with(io, config, Arc::new(RejectRequests)).await
    }

    pub async fn establish_with<S: AsyncStream>(
        io: S,
        config: SessionConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Session, SessionError> {
        let correlator = Correlator::new();
        let request_id = correlator.next_id();
        let (done, identified) = oneshot::channel();
        let request = IdentityRequest {
            uuid: config.uuid,
            instance_type: config.instance_type,
            instance_flavor: config.instance_flavor,
        };
        let session = Self::start(
            io,
            Role::Client,
            config,
            handler,
            correlator,
            Handshake::Client { request_id, done },
        );
        session.send(Message::new(request_id, Payload::IdentityRequest(request)))?;
        session.await_identity(identified).await
    }

    /// Runs the server handshake: waits for the peer's identity request and
    /// assigns it a cvid from `context`.
    pub async fn accept<S: AsyncStream>(
        io: S,
        config: SessionConfig,
        context: &ServerContext,
    ) -> Result<Session, SessionError> {
        let (done, identified) = oneshot::channel();
        let session = Self::start(
            io,
            Role::Server,
            config,
            context.handler(),
            Correlator::new(),
            Handshake::Server {
                allocator: context.allocator(),
                local_cvid: context.local_cvid(),
                done,
            },
        );
        session.await_identity(identified).await
    }

    fn start<S: AsyncStream>(
        io: S,
        role: Role,
        config: SessionConfig,
        handler: Arc<dyn RequestHandler>,
        correlator: Correlator,
        handshake: Handshake,
    ) -> Session {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound, queue) = mpsc::unbounded_channel();
        // Handshaking before either task runs; the reader may establish at once
        let (state, _) = watch::channel(SessionState::Handshaking);
        let max_frame_len = config.max_frame_len;
        let tree = Arc::new(StateTree::new(&config.namespace));

        let inner = Arc::new(Inner {
            role,
            config,
            state,
            identity: RwLock::new(None),
            outbound: Mutex::new(Some(outbound)),
            correlator,
            streams: StreamRegistry::new(),
            tree,
            handler,
            reader: Mutex::new(None),
        });

        tokio::spawn(write_loop(
            Arc::downgrade(&inner),
            FrameWriter::new(write_half, max_frame_len),
            queue,
        ));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&inner),
            FrameReader::new(read_half, max_frame_len),
            inner.state.subscribe(),
            handshake,
        ));
        *inner.reader.lock() = Some(reader);
        Session { inner }
    }

    async fn await_identity(
        self,
        identified: oneshot::Receiver<Result<SessionIdentity, SessionError>>,
    ) -> Result<Session, SessionError> {
        let limit = self.inner.config.handshake_timeout;
        let outcome = if limit.is_zero() {
            identified.await.unwrap_or(Err(SessionError::ConnectionClosed))
        } else {
            match tokio::time::timeout(limit, identified).await {
                Ok(result) => result.unwrap_or(Err(SessionError::ConnectionClosed)),
                Err(_) => Err(SessionError::HandshakeFailed(format!(
                    "no identity exchange within {limit:?}"
                ))),
            }
        };
        match outcome {
            Ok(_) => Ok(self),
            Err(err) => {
                self.shutdown(CloseCause::Handshake(err.to_string())).await;
                Err(err)
            }
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        *self.inner.identity.read()
    }

    pub fn cvid(&self) -> Option<i32> {
        self.identity().map(|identity| identity.cvid)
    }

    pub fn peer_cvid(&self) -> Option<i32> {
        self.identity().map(|identity| identity.peer_cvid)
    }

    pub fn peer_uuid(&self) -> Option<Uuid> {
        self.identity().map(|identity| identity.peer_uuid)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The session's local replica.
    pub fn tree(&self) -> &Arc<StateTree> {
        &self.inner.tree
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending()
    }

    pub fn open_streams(&self) -> usize {
        self.inner.streams.len()
    }

    pub(crate) fn streams(&self) -> &StreamRegistry {
        &self.inner.streams
    }

    pub(crate) fn executor(&self) -> Arc<dyn CallbackExecutor> {
        Arc::clone(&self.inner.config.executor)
    }

    fn ensure_established(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Established => Ok(()),
            SessionState::Closing | SessionState::Closed => Err(SessionError::ConnectionClosed),
            SessionState::Connecting | SessionState::Handshaking => {
                Err(SessionError::HandshakeIncomplete)
            }
        }
    }

    fn send(&self, mut message: Message) -> Result<(), SessionError> {
        if !message.payload.is_handshake() {
            self.ensure_established()?;
        }
        if let Some(identity) = self.identity() {
            message.from = identity.cvid;
            message.to = identity.peer_cvid;
        }
        let body = encode_message(&message);
        let max = self.inner.config.max_frame_len;
        if body.len() > max {
            return Err(SessionError::MessageTooLarge {
                len: body.len(),
                max,
            });
        }
        let outbound = self.inner.outbound.lock();
        let sender = outbound.as_ref().ok_or(SessionError::ConnectionClosed)?;
        sender.send(body).map_err(|_| SessionError::ConnectionClosed)
    }

    /// Sends a message that expects no reply.
    pub fn send_event(&self, payload: Payload) -> Result<(), SessionError> {
        self.send(Message::new(UNCORRELATED, payload))
    }

    /// Answers the peer's request `id`.
    pub fn reply(&self, id: i32, payload: Payload) -> Result<(), SessionError> {
        self.send(Message::new(id, payload))
    }

    /// Sends a correlated request with the configured default timeout.
    pub fn request(&self, payload: Payload) -> Result<PendingResponse, SessionError> {
        self.request_with_timeout(payload, self.inner.config.request_timeout)
    }

    /// Sends a correlated request. A zero `timeout` waits until the response
    /// arrives or the session closes.
    pub fn request_with_timeout(
        &self,
        payload: Payload,
        timeout: Duration,
    ) -> Result<PendingResponse, SessionError> {
        self.ensure_established()?;
        let id = self.inner.correlator.next_id();
        // registered before the write so a fast response cannot miss it
        let pending = self.inner.correlator.register(id, timeout)?;
        self.send(Message::new(id, payload))?;
        Ok(pending)
    }

    pub async fn send_request(&self, payload: Payload) -> Result<Message, SessionError> {
        self.request(payload)?.await
    }

    /// Authenticates with a digest of `password`.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), SessionError> {
        let login = LoginRequest {
            username: username.to_string(),
            password_digest: auth::password_digest(password),
        };
        let response = self.send_request(Payload::Login(login)).await?;
        match response.payload {
            Payload::Outcome(outcome) if outcome.ok => {
                tracing::info!(
                    target = "sandpolis::session",
                    cvid = ?self.cvid(),
                    username,
                    "login accepted"
                );
                Ok(())
            }
            Payload::Outcome(outcome) => Err(SessionError::AuthenticationFailed(outcome.message)),
            other => Err(SessionError::UnexpectedResponse {
                expected: "outcome",
                received: other.name(),
            }),
        }
    }

    /// Reads everything at or beneath `oid` from the peer and merges it into
    /// the local tree.
    pub async fn request_snapshot(&self, oid: &Oid) -> Result<UpdateRecord, SessionError> {
        let request = SnapshotRequest { oid: oid.clone() };
        let response = self.send_request(Payload::SnapshotRequest(request)).await?;
        match response.payload {
            Payload::SnapshotResponse(snapshot) => {
                let applied = self.inner.tree.merge(&snapshot.record)?;
                tracing::debug!(
                    target = "sandpolis::session",
                    oid = %oid,
                    entries = snapshot.record.len(),
                    applied,
                    "snapshot merged"
                );
                Ok(snapshot.record)
            }
            Payload::Outcome(outcome) if !outcome.ok => Err(SessionError::Rejected(outcome.message)),
            other => Err(SessionError::UnexpectedResponse {
                expected: "snapshot_response",
                received: other.name(),
            }),
        }
    }

    /// Sends a local mutation to the peer.
    pub async fn push_update(&self, record: UpdateRecord) -> Result<(), SessionError> {
        let response = self
            .send_request(Payload::UpdatePush(UpdatePush { record }))
            .await?;
        expect_success(response)
    }

    /// Allocates a stream id and asks the peer to start the stream.
    ///
    /// The handle is returned before the peer acknowledges; see
    /// [`StreamHandle::started`].
    pub fn open_stream(
        &self,
        kind: StreamKind,
        oid: Option<Oid>,
        params: Bytes,
    ) -> Result<StreamHandle, SessionError> {
        self.open_stream_with(kind, oid, params, Vec::new())
    }

    fn open_stream_with(
        &self,
        kind: StreamKind,
        oid: Option<Oid>,
        params: Bytes,
        consumers: Vec<Consumer>,
    ) -> Result<StreamHandle, SessionError> {
        self.ensure_established()?;
        let stream_id = self.inner.streams.open(kind.clone())?;
        for consumer in consumers {
            self.inner.streams.register(stream_id, consumer);
        }
        let start = StreamStart {
            stream_id,
            kind: kind.clone(),
            oid,
            params,
        };
        match self.request(Payload::StreamStart(start)) {
            Ok(pending) => {
                tracing::debug!(
                    target = "sandpolis::session",
                    stream_id,
                    kind = kind.label(),
                    "stream requested"
                );
                Ok(StreamHandle::new(stream_id, kind, self.clone(), pending))
            }
            Err(err) => {
                self.inner
                    .streams
                    .finish(stream_id, CloseReason::Rejected(err.to_string()));
                Err(err)
            }
        }
    }

    /// Replicates the subtree at `oid`: every data payload on the returned
    /// stream is merged into [`Session::tree`].
    pub fn sync(&self, oid: &Oid) -> Result<StreamHandle, SessionError> {
        let tree = Arc::clone(&self.inner.tree);
        let merge: Consumer = Arc::new(move |event: &StreamEvent| {
            let StreamEvent::Data(data) = event else {
                return;
            };
            match record_codec::decode(data) {
                Ok(record) => {
                    if let Err(err) = tree.merge(&record) {
                        tracing::warn!(
                            target = "sandpolis::session",
                            error = %err,
                            "discarding sync update outside of the tree"
                        );
                    }
                }
                Err(err) => {
                    metrics::record_frame_error("decode");
                    tracing::warn!(
                        target = "sandpolis::session",
                        error = %err,
                        "discarding malformed sync update"
                    );
                }
            }
        });
        self.open_stream_with(StreamKind::StateSync, Some(oid.clone()), Bytes::new(), vec![merge])
    }

    /// Stops the stream at the peer, then removes it locally.
    pub async fn close_stream(&self, handle: &StreamHandle) -> Result<(), SessionError> {
        let stop = StreamStop {
            stream_id: handle.id(),
        };
        let response = self.send_request(Payload::StreamStop(stop)).await?;
        expect_success(response)?;
        self.inner.streams.finish(handle.id(), CloseReason::Stopped);
        Ok(())
    }

    /// Closes the session and waits for teardown to finish.
    pub async fn close(&self) {
        self.shutdown(CloseCause::Local).await;
        self.closed().await;
    }

    /// Resolves once the session reaches [`SessionState::Closed`].
    pub async fn closed(&self) {
        let mut states = self.inner.state.subscribe();
        let _ = states.wait_for(|state| *state == SessionState::Closed).await;
    }

    async fn shutdown(&self, cause: CloseCause) {
        let mut previous = None;
        self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            previous = Some(*state);
            *state = SessionState::Closing;
            true
        });
        let Some(previous) = previous else {
            return;
        };

        let requests = self.inner.correlator.close();
        let streams = self.inner.streams.close_all();
        // the writer drains what is queued, then shuts the connection down
        self.inner.outbound.lock().take();
        self.inner.handler.closed(self).await;

        if previous == SessionState::Established {
            metrics::OPEN_SESSIONS.dec();
        }
        metrics::record_session(self.inner.role.label(), cause.label());
        tracing::info!(
            target = "sandpolis::session",
            role = self.inner.role.label(),
            cvid = ?self.cvid(),
            failed_requests = requests,
            closed_streams = streams,
            reason = %cause,
            "session closed"
        );
        self.inner.state.send_replace(SessionState::Closed);
    }

    fn complete_handshake(&self, handshake: Handshake, message: Message) {
        let (identity, done) = match (handshake, message.payload) {
            (Handshake::Client { done, .. }, Payload::IdentityResponse(response)) => {
                if response.cvid == UNCORRELATED {
                    let _ = done.send(Err(SessionError::HandshakeFailed(
                        "peer assigned no cvid".into(),
                    )));
                    return;
                }
                let identity = SessionIdentity {
                    cvid: response.cvid,
                    peer_cvid: response.server_cvid,
                    peer_uuid: response.server_uuid,
                };
                (identity, done)
            }
            (
                Handshake::Server {
                    allocator,
                    local_cvid,
                    done,
                },
                Payload::IdentityRequest(request),
            ) => {
                let assigned = allocator.allocate();
                let identity = SessionIdentity {
                    cvid: local_cvid,
                    peer_cvid: assigned,
                    peer_uuid: request.uuid,
                };
                *self.inner.identity.write() = Some(identity);
                let response = IdentityResponse {
                    cvid: assigned,
                    server_cvid: local_cvid,
                    server_uuid: self.inner.config.uuid,
                };
                if let Err(err) = self.send(Message::new(message.id, Payload::IdentityResponse(response))) {
                    let _ = done.send(Err(err));
                    return;
                }
                tracing::debug!(
                    target = "sandpolis::session",
                    peer_cvid = assigned,
                    instance_type = ?request.instance_type,
                    instance_flavor = ?request.instance_flavor,
                    "identity assigned"
                );
                (identity, done)
            }
            (handshake, _) => {
                let done: Identified = match handshake {
                    Handshake::Client { done, .. } | Handshake::Server { done, .. } => done,
                };
                let _ = done.send(Err(SessionError::HandshakeFailed(
                    "unexpected handshake payload".into(),
                )));
                return;
            }
        };

        *self.inner.identity.write() = Some(identity);
        let established = self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = SessionState::Established;
            true
        });
        if established {
            metrics::OPEN_SESSIONS.inc();
            tracing::info!(
                target = "sandpolis::session",
                role = self.inner.role.label(),
                cvid = identity.cvid,
                peer_cvid = identity.peer_cvid,
                peer_uuid = %identity.peer_uuid,
                "session established"
            );
            let _ = done.send(Ok(identity));
        } else {
            let _ = done.send(Err(SessionError::ConnectionClosed));
        }
    }

    async fn dispatch(&self, message: Message, handshake: &mut Option<Handshake>) {
        if handshake.as_ref().is_some_and(|hook| hook.accepts(&message)) {
            if let Some(hook) = handshake.take() {
                self.complete_handshake(hook, message);
            }
            return;
        }

        match message.payload.role() {
            PayloadRole::Response => self.on_response(message),
            PayloadRole::Request => self.on_request(message).await,
            PayloadRole::Event => self.on_event(message),
        }
    }

    fn on_response(&self, message: Message) {
        if let Err(message) = self.inner.correlator.resolve(message) {
            metrics::record_unmatched_response(message.payload.name());
            tracing::warn!(
                target = "sandpolis::session",
                request_id = message.id,
                payload = message.payload.name(),
                "dropping response with no pending request"
            );
        }
    }

    async fn on_request(&self, message: Message) {
        // plugin payloads double as replies to plugin requests
        if matches!(message.payload, Payload::Plugin(_)) && self.inner.correlator.contains(message.id) {
            self.on_response(message);
            return;
        }

        if self.state() != SessionState::Established {
            tracing::warn!(
                target = "sandpolis::session",
                request_id = message.id,
                payload = message.payload.name(),
                "dropping request received before the handshake"
            );
            return;
        }

        let reply = if message.payload.is_handshake() {
            tracing::warn!(
                target = "sandpolis::session",
                request_id = message.id,
                "peer repeated its identity request"
            );
            Some(Payload::Outcome(Outcome::failure("already identified")))
        } else {
            self.inner.handler.handle(self, &message).await
        };

        let Some(reply) = reply else {
            return;
        };
        if message.id == UNCORRELATED {
            tracing::debug!(
                target = "sandpolis::session",
                payload = message.payload.name(),
                "not replying to uncorrelated request"
            );
            return;
        }
        if let Err(err) = self.reply(message.id, reply) {
            tracing::debug!(
                target = "sandpolis::session",
                request_id = message.id,
                error = %err,
                "reply not sent"
            );
        }
    }

    fn on_event(&self, message: Message) {
        match message.payload {
            Payload::StreamData(data) => {
                self.inner
                    .streams
                    .dispatch(data.stream_id, data.data, self.inner.config.retry_delay);
            }
            Payload::Unknown(field) => {
                metrics::record_frame_error("unknown_payload");
                tracing::debug!(
                    target = "sandpolis::session",
                    field = field.number,
                    request_id = message.id,
                    "ignoring payload kind this build does not know"
                );
            }
            other => {
                tracing::debug!(
                    target = "sandpolis::session",
                    payload = other.name(),
                    "ignoring event"
                );
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("identity", &self.identity())
            .finish()
    }
}

fn expect_success(response: Message) -> Result<(), SessionError> {
    match response.payload {
        Payload::Outcome(outcome) if outcome.ok => Ok(()),
        Payload::Outcome(outcome) => Err(SessionError::Rejected(outcome.message)),
        other => Err(SessionError::UnexpectedResponse {
            expected: "outcome",
            received: other.name(),
        }),
    }
}

async fn read_loop<S: AsyncStream>(
    session: Weak<Inner>,
    mut frames: FrameReader<ReadHalf<S>>,
    mut states: watch::Receiver<SessionState>,
    handshake: Handshake,
) {
    let mut handshake = Some(handshake);
    let cause = loop {
        let next = tokio::select! {
            next = frames.next_frame() => next,
            _ = states.wait_for(|state| state.is_terminal()) => return,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break CloseCause::PeerClosed,
            Err(err) => {
                metrics::record_frame_error(err.reason());
                break CloseCause::Transport(err.to_string());
            }
        };
        metrics::record_frame("inbound");

        let message = match decode_message(&frame) {
            Ok(message) => message,
            Err(err) => {
                metrics::record_frame_error("decode");
                tracing::warn!(
                    target = "sandpolis::session",
                    error = %err,
                    len = frame.len(),
                    "dropping undecodable message"
                );
                tracing::trace!(
                    target = "sandpolis::session",
                    frame = %telemetry::hexdump(&frame),
                    "undecodable frame"
                );
                continue;
            }
        };

        let Some(inner) = session.upgrade() else {
            return;
        };
        Session { inner }.dispatch(message, &mut handshake).await;
    };

    // a pending handshake fails with ConnectionClosed once the hook drops
    drop(handshake);
    if let Some(inner) = session.upgrade() {
        Session { inner }.shutdown(cause).await;
    }
}

async fn write_loop<S: AsyncStream>(
    session: Weak<Inner>,
    mut frames: FrameWriter<WriteHalf<S>>,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(body) = queue.recv().await {
        if let Err(err) = frames.send(&body).await {
            metrics::record_frame_error(err.reason());
            tracing::debug!(
                target = "sandpolis::session",
                error = %err,
                "write failed"
            );
            if let Some(inner) = session.upgrade() {
                Session { inner }
                    .shutdown(CloseCause::Transport(err.to_string()))
                    .await;
            }
            return;
        }
        metrics::record_frame("outbound");
    }
    let _ = frames.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SnapshotResponse, StreamData};
    use state_tree::{AttributeChange, Value};
    use tokio::io::DuplexStream;

    struct FakePeer {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl FakePeer {
        fn new(io: DuplexStream) -> Self {
            let (read_half, write_half) = tokio::io::split(io);
            Self {
                reader: FrameReader::new(read_half, DEFAULT_MAX_FRAME_LEN),
                writer: FrameWriter::new(write_half, DEFAULT_MAX_FRAME_LEN),
            }
        }

        async fn recv(&mut self) -> Message {
            let frame = self.reader.next_frame().await.unwrap().unwrap();
            decode_message(&frame).unwrap()
        }

        async fn send(&mut self, message: Message) {
            self.writer.send(&encode_message(&message)).await.unwrap();
        }

        /// Answers the identity request with cvid 42 from server cvid 1.
        async fn identify(&mut self) -> Message {
            let request = self.recv().await;
            let response = IdentityResponse {
                cvid: 42,
                server_cvid: 1,
                server_uuid: Uuid::nil(),
            };
            self.send(Message::new(request.id, Payload::IdentityResponse(response)))
                .await;
            request
        }
    }

    async fn connected() -> (Session, FakePeer) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let mut peer = FakePeer::new(remote);
        let (session, _) = tokio::join!(
            Session::establish(local, SessionConfig::default()),
            peer.identify()
        );
        (session.unwrap(), peer)
    }

    #[test_timeout::tokio_timeout_test]
    async fn handshake_assigns_identity() {
        let (session, mut peer) = connected().await;
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(session.cvid(), Some(42));
        assert_eq!(session.peer_cvid(), Some(1));

        let pending = session.request(Payload::Outcome(Outcome::success())).unwrap();
        let sent = peer.recv().await;
        assert_eq!((sent.from, sent.to), (42, 1));
        peer.send(Message::new(sent.id, Payload::Outcome(Outcome::success())))
            .await;
        assert!(pending.await.is_ok());
    }

    #[test_timeout::tokio_timeout_test]
    async fn identity_request_fields_come_from_config() {
        let (local, remote) = tokio::io::duplex(4096);
        let mut peer = FakePeer::new(remote);
        let config = SessionConfig::default();
        let uuid = config.uuid;
        let (session, request) = tokio::join!(Session::establish(local, config), peer.identify());
        assert!(session.is_ok());
        let Payload::IdentityRequest(request) = request.payload else {
            panic!("expected identity request");
        };
        assert_eq!(request.uuid, uuid);
        assert_eq!(request.instance_type, InstanceType::Client);
    }

    #[test_timeout::tokio_timeout_test]
    async fn snapshot_merges_into_local_tree() {
        let (session, mut peer) = connected().await;
        let oid = Oid::parse("/profile/abc").unwrap();
        let hostname = oid.child("hostname");

        let serve = async {
            let request = peer.recv().await;
            let record = UpdateRecord::new().with(hostname.clone(), AttributeChange::set("desktop-1"));
            peer.send(Message::new(
                request.id,
                Payload::SnapshotResponse(SnapshotResponse { record }),
            ))
            .await;
        };
        let (record, ()) = tokio::join!(session.request_snapshot(&oid), serve);
        assert_eq!(record.unwrap().len(), 1);
        assert_eq!(
            session.tree().value(&hostname),
            Some(Value::String("desktop-1".into()))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn repeated_identity_response_is_not_intercepted() {
        let (session, mut peer) = connected().await;
        let stray = IdentityResponse {
            cvid: 99,
            server_cvid: 7,
            server_uuid: Uuid::nil(),
        };
        peer.send(Message::new(1, Payload::IdentityResponse(stray))).await;

        // a later round trip proves the stray message was processed
        let pending = session.request(Payload::Outcome(Outcome::success())).unwrap();
        let sent = peer.recv().await;
        peer.send(Message::new(sent.id, Payload::Outcome(Outcome::success())))
            .await;
        assert!(pending.await.is_ok());
        assert_eq!(session.cvid(), Some(42));
        assert_eq!(session.peer_cvid(), Some(1));
    }

    #[test_timeout::tokio_timeout_test]
    async fn requests_before_handshake_are_refused() {
        let (local, _remote) = tokio::io::duplex(4096);
        let session = Session::start(
            local,
            Role::Client,
            SessionConfig::default(),
            Arc::new(RejectRequests),
            Correlator::new(),
            Handshake::Client {
                request_id: 1,
                done: oneshot::channel().0,
            },
        );
        assert!(matches!(
            session.request(Payload::Outcome(Outcome::success())),
            Err(SessionError::HandshakeIncomplete)
        ));
        assert!(matches!(
            session.open_stream(StreamKind::Shell, None, Bytes::new()),
            Err(SessionError::HandshakeIncomplete)
        ));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn silent_peer_fails_the_handshake() {
        let (local, _remote) = tokio::io::duplex(4096);
        let err = Session::establish(local, SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HandshakeFailed(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn peer_disconnect_fails_pending_work() {
        let (session, peer) = connected().await;
        let pending = session.request(Payload::Outcome(Outcome::success())).unwrap();
        let stream = session
            .open_stream(StreamKind::ProfileEvents, None, Bytes::new())
            .unwrap();
        let closed = Arc::new(Mutex::new(Vec::new()));
        let seen = closed.clone();
        stream.register(move |event| seen.lock().push(event.clone()));

        drop(peer);
        session.closed().await;
        assert!(matches!(pending.await, Err(SessionError::ConnectionClosed)));
        assert_eq!(
            *closed.lock(),
            vec![StreamEvent::Closed(CloseReason::ConnectionClosed)]
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.request(Payload::Outcome(Outcome::success())),
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn undecodable_frame_is_skipped() {
        let (session, mut peer) = connected().await;
        peer.writer.send(&[0xff, 0xff, 0xff]).await.unwrap();
        let stream = session
            .open_stream(StreamKind::Screenshot, None, Bytes::new())
            .unwrap();
        let start = peer.recv().await;
        let hits = Arc::new(Mutex::new(0usize));
        let counter = hits.clone();
        stream.register(move |event| {
            if matches!(event, StreamEvent::Data(_)) {
                *counter.lock() += 1;
            }
        });
        peer.send(Message::new(start.id, Payload::Outcome(Outcome::success())))
            .await;
        stream.started().await.unwrap();
        peer.send(Message::new(
            UNCORRELATED,
            Payload::StreamData(StreamData {
                stream_id: stream.id(),
                data: Bytes::from_static(b"tile"),
            }),
        ))
        .await;

        // round trip to make sure the data was dispatched
        let pending = session.request(Payload::Outcome(Outcome::success())).unwrap();
        let sent = peer.recv().await;
        peer.send(Message::new(sent.id, Payload::Outcome(Outcome::success())))
            .await;
        pending.await.unwrap();
        assert_eq!(*hits.lock(), 1);
        assert_eq!(session.state(), SessionState::Established);
    }

    #[test_timeout::tokio_timeout_test]
    async fn client_rejects_peer_requests() {
        let (_session, mut peer) = connected().await;
        let oid = Oid::parse("/profile").unwrap();
        peer.send(Message::new(
            9,
            Payload::SnapshotRequest(SnapshotRequest { oid }),
        ))
        .await;
        let reply = peer.recv().await;
        assert_eq!(reply.id, 9);
        assert!(matches!(reply.payload, Payload::Outcome(Outcome { ok: false, .. })));
    }
}
