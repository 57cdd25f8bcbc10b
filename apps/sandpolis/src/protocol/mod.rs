pub mod wire;

use bytes::Bytes;
use state_tree::{InstanceFlavor, InstanceType, Oid, RawField, UpdateRecord};
use uuid::Uuid;

pub use wire::{decode_message, encode_message};

/// Request id reserved for messages that expect no reply.
pub const UNCORRELATED: i32 = 0;

/// One framed unit on a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i32,
    pub from: i32,
    pub to: i32,
    pub payload: Payload,
    /// Envelope fields this build does not recognise.
    pub unknown: Vec<RawField>,
}

impl Message {
    pub fn new(id: i32, payload: Payload) -> Self {
        Self {
            id,
            from: 0,
            to: 0,
            payload,
            unknown: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    IdentityRequest(IdentityRequest),
    IdentityResponse(IdentityResponse),
    Login(LoginRequest),
    Outcome(Outcome),
    SnapshotRequest(SnapshotRequest),
    SnapshotResponse(SnapshotResponse),
    StreamStart(StreamStart),
    StreamStop(StreamStop),
    StreamData(StreamData),
    UpdatePush(UpdatePush),
    Plugin(PluginPayload),
    /// A payload kind newer than this build.
    Unknown(RawField),
}

/// How the reader routes an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRole {
    Request,
    Response,
    Event,
}

impl Payload {
    pub fn role(&self) -> PayloadRole {
        match self {
            Payload::IdentityRequest(_)
            | Payload::Login(_)
            | Payload::SnapshotRequest(_)
            | Payload::StreamStart(_)
            | Payload::StreamStop(_)
            | Payload::UpdatePush(_)
            | Payload::Plugin(_) => PayloadRole::Request,
            Payload::IdentityResponse(_) | Payload::Outcome(_) | Payload::SnapshotResponse(_) => {
                PayloadRole::Response
            }
            Payload::StreamData(_) | Payload::Unknown(_) => PayloadRole::Event,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Payload::IdentityRequest(_) => "identity_request",
            Payload::IdentityResponse(_) => "identity_response",
            Payload::Login(_) => "login",
            Payload::Outcome(_) => "outcome",
            Payload::SnapshotRequest(_) => "snapshot_request",
            Payload::SnapshotResponse(_) => "snapshot_response",
            Payload::StreamStart(_) => "stream_start",
            Payload::StreamStop(_) => "stream_stop",
            Payload::StreamData(_) => "stream_data",
            Payload::UpdatePush(_) => "update_push",
            Payload::Plugin(_) => "plugin",
            Payload::Unknown(_) => "unknown",
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Payload::IdentityRequest(_) | Payload::IdentityResponse(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRequest {
    pub uuid: Uuid,
    pub instance_type: InstanceType,
    pub instance_flavor: InstanceFlavor,
}

/// Handshake reply: `cvid` is the identity assigned to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityResponse {
    pub cvid: i32,
    pub server_cvid: i32,
    pub server_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub username: String,
    /// Lowercase hex SHA-256 of the password.
    pub password_digest: String,
}

/// Generic success/failure reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    pub ok: bool,
    pub message: String,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub oid: Oid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotResponse {
    pub record: UpdateRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    StateSync,
    ProfileEvents,
    Screenshot,
    Shell,
    Plugin(String),
}

impl StreamKind {
    pub(crate) fn code(&self) -> u64 {
        match self {
            StreamKind::StateSync => 1,
            StreamKind::ProfileEvents => 2,
            StreamKind::Screenshot => 3,
            StreamKind::Shell => 4,
            StreamKind::Plugin(_) => 15,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            StreamKind::StateSync => "state_sync",
            StreamKind::ProfileEvents => "profile_events",
            StreamKind::Screenshot => "screenshot",
            StreamKind::Shell => "shell",
            StreamKind::Plugin(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStart {
    pub stream_id: i32,
    pub kind: StreamKind,
    pub oid: Option<Oid>,
    pub params: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStop {
    pub stream_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData {
    pub stream_id: i32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePush {
    pub record: UpdateRecord,
}

/// Extension payload: opaque bytes tagged with the plugin's message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPayload {
    pub type_tag: String,
    pub data: Bytes,
}
