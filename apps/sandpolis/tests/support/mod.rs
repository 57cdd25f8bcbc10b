#![allow(dead_code)]

use sandpolis_client_core::protocol::{
    decode_message, encode_message, IdentityResponse, Message, Outcome, Payload, SnapshotRequest,
};
use sandpolis_client_core::session::{Session, SessionConfig};
use sandpolis_client_core::transport::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN};
use state_tree::Oid;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use uuid::Uuid;

pub const ASSIGNED_CVID: i32 = 42;
pub const PEER_CVID: i32 = 1;

/// Scripted far end of a session, speaking raw frames.
pub struct FakePeer {
    pub uuid: Uuid,
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl FakePeer {
    pub fn new(io: DuplexStream) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            uuid: Uuid::new_v4(),
            reader: FrameReader::new(read_half, DEFAULT_MAX_FRAME_LEN),
            writer: FrameWriter::new(write_half, DEFAULT_MAX_FRAME_LEN),
        }
    }

    pub async fn recv(&mut self) -> Message {
        let frame = self
            .reader
            .next_frame()
            .await
            .expect("frame")
            .expect("peer closed");
        decode_message(&frame).expect("decodable message")
    }

    /// `None` once the session has shut its side down.
    pub async fn recv_or_eof(&mut self) -> Option<Message> {
        let frame = self.reader.next_frame().await.expect("frame")?;
        Some(decode_message(&frame).expect("decodable message"))
    }

    pub async fn send(&mut self, message: Message) {
        self.writer
            .send(&encode_message(&message))
            .await
            .expect("send frame");
    }

    pub async fn send_raw(&mut self, body: &[u8]) {
        self.writer.send(body).await.expect("send frame");
    }

    pub async fn reply(&mut self, id: i32, payload: Payload) {
        self.send(Message::new(id, payload)).await;
    }

    pub async fn reply_ok(&mut self, id: i32) {
        self.reply(id, Payload::Outcome(Outcome::success())).await;
    }

    /// Answers the identity request the way a server assigning
    /// [`ASSIGNED_CVID`] would.
    pub async fn identify(&mut self) -> Message {
        let request = self.recv().await;
        let response = IdentityResponse {
            cvid: ASSIGNED_CVID,
            server_cvid: PEER_CVID,
            server_uuid: self.uuid,
        };
        self.reply(request.id, Payload::IdentityResponse(response))
            .await;
        request
    }
}

pub async fn connect_fake_with(config: SessionConfig) -> (Session, FakePeer) {
    let (local, remote) = tokio::io::duplex(1 << 16);
    let mut peer = FakePeer::new(remote);
    let (session, _) = tokio::join!(Session::establish(local, config), peer.identify());
    (session.expect("handshake"), peer)
}

pub async fn connect_fake() -> (Session, FakePeer) {
    connect_fake_with(SessionConfig::default()).await
}

pub fn oid(text: &str) -> Oid {
    Oid::parse(text).expect("valid oid")
}

pub fn snapshot_of(text: &str) -> Payload {
    Payload::SnapshotRequest(SnapshotRequest { oid: oid(text) })
}
