//! Envelope codec.
//!
//! ```text
//! Message { sint32 id = 1; sint32 from = 2; sint32 to = 3;
//!           oneof payload = 10..=63 }
//! ```
//!
//! Payload numbers 10 through 20 are assigned below; the rest of the range is
//! reserved, and a payload there decodes to [`Payload::Unknown`].

use bytes::Bytes;
use state_tree::codec::wire::{Field, Reader, WireError, Writer};
use state_tree::codec as record_codec;
use state_tree::{InstanceFlavor, InstanceType, Oid};
use uuid::Uuid;

use super::{
    IdentityRequest, IdentityResponse, LoginRequest, Message, Outcome, Payload, PluginPayload,
    SnapshotRequest, SnapshotResponse, StreamData, StreamKind, StreamStart, StreamStop,
    UpdatePush,
};

const MESSAGE_ID: u32 = 1;
const MESSAGE_FROM: u32 = 2;
const MESSAGE_TO: u32 = 3;

const PAYLOAD_IDENTITY_REQUEST: u32 = 10;
const PAYLOAD_IDENTITY_RESPONSE: u32 = 11;
const PAYLOAD_LOGIN: u32 = 12;
const PAYLOAD_OUTCOME: u32 = 13;
const PAYLOAD_SNAPSHOT_REQUEST: u32 = 14;
const PAYLOAD_SNAPSHOT_RESPONSE: u32 = 15;
const PAYLOAD_STREAM_START: u32 = 16;
const PAYLOAD_STREAM_STOP: u32 = 17;
const PAYLOAD_STREAM_DATA: u32 = 18;
const PAYLOAD_UPDATE_PUSH: u32 = 19;
const PAYLOAD_PLUGIN: u32 = 20;
const PAYLOAD_RANGE: std::ops::RangeInclusive<u32> = 10..=63;

const PLUGIN_STREAM_CODE: u64 = 15;

pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut writer = Writer::with_capacity(64);
    if message.id != 0 {
        writer.sint32(MESSAGE_ID, message.id);
    }
    if message.from != 0 {
        writer.sint32(MESSAGE_FROM, message.from);
    }
    if message.to != 0 {
        writer.sint32(MESSAGE_TO, message.to);
    }
    match &message.payload {
        Payload::IdentityRequest(request) => {
            writer.message(PAYLOAD_IDENTITY_REQUEST, |out| {
                out.string(1, &request.uuid.to_string());
                out.varint(2, u64::from(request.instance_type.code()));
                out.varint(3, u64::from(request.instance_flavor.code()));
            });
        }
        Payload::IdentityResponse(response) => {
            writer.message(PAYLOAD_IDENTITY_RESPONSE, |out| {
                out.sint32(1, response.cvid);
                out.sint32(2, response.server_cvid);
                out.string(3, &response.server_uuid.to_string());
            });
        }
        Payload::Login(login) => {
            writer.message(PAYLOAD_LOGIN, |out| {
                out.string(1, &login.username);
                out.string(2, &login.password_digest);
            });
        }
        Payload::Outcome(outcome) => {
            writer.message(PAYLOAD_OUTCOME, |out| {
                out.bool(1, outcome.ok);
                if !outcome.message.is_empty() {
                    out.string(2, &outcome.message);
                }
            });
        }
        Payload::SnapshotRequest(request) => {
            writer.message(PAYLOAD_SNAPSHOT_REQUEST, |out| {
                out.string(1, &request.oid.to_string());
            });
        }
        Payload::SnapshotResponse(response) => {
            writer.message(PAYLOAD_SNAPSHOT_RESPONSE, |out| {
                out.message(1, |nested| record_codec::write_record(nested, &response.record));
            });
        }
        Payload::StreamStart(start) => {
            writer.message(PAYLOAD_STREAM_START, |out| {
                out.sint32(1, start.stream_id);
                out.varint(2, start.kind.code());
                if let StreamKind::Plugin(name) = &start.kind {
                    out.string(3, name);
                }
                if let Some(oid) = &start.oid {
                    out.string(4, &oid.to_string());
                }
                if !start.params.is_empty() {
                    out.bytes(5, &start.params);
                }
            });
        }
        Payload::StreamStop(stop) => {
            writer.message(PAYLOAD_STREAM_STOP, |out| out.sint32(1, stop.stream_id));
        }
        Payload::StreamData(data) => {
            writer.message(PAYLOAD_STREAM_DATA, |out| {
                out.sint32(1, data.stream_id);
                out.bytes(2, &data.data);
            });
        }
        Payload::UpdatePush(push) => {
            writer.message(PAYLOAD_UPDATE_PUSH, |out| {
                out.message(1, |nested| record_codec::write_record(nested, &push.record));
            });
        }
        Payload::Plugin(plugin) => {
            writer.message(PAYLOAD_PLUGIN, |out| {
                out.string(1, &plugin.type_tag);
                out.bytes(2, &plugin.data);
            });
        }
        Payload::Unknown(raw) => writer.raw(raw),
    }
    writer.raw_all(&message.unknown);
    writer.into_bytes()
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, WireError> {
    let mut id = 0;
    let mut from = 0;
    let mut to = 0;
    let mut payload = None;
    let mut unknown = Vec::new();

    let mut reader = Reader::new(bytes);
    while let Some(field) = reader.next_field()? {
        match field.number {
            MESSAGE_ID => id = field.as_sint32("id")?,
            MESSAGE_FROM => from = field.as_sint32("from")?,
            MESSAGE_TO => to = field.as_sint32("to")?,
            number if PAYLOAD_RANGE.contains(&number) => {
                if payload.is_some() {
                    return Err(WireError::malformed("message carries more than one payload"));
                }
                payload = Some(decode_payload(field)?);
            }
            _ => unknown.push(field.into_raw()),
        }
    }

    let payload = payload.ok_or_else(|| WireError::malformed("message without payload"))?;
    Ok(Message {
        id,
        from,
        to,
        payload,
        unknown,
    })
}

fn decode_payload(field: Field<'_>) -> Result<Payload, WireError> {
    let body = match field.number {
        PAYLOAD_IDENTITY_REQUEST..=PAYLOAD_PLUGIN => field.as_bytes("payload")?,
        _ => return Ok(Payload::Unknown(field.into_raw())),
    };
    let payload = match field.number {
        PAYLOAD_IDENTITY_REQUEST => Payload::IdentityRequest(decode_identity_request(body)?),
        PAYLOAD_IDENTITY_RESPONSE => Payload::IdentityResponse(decode_identity_response(body)?),
        PAYLOAD_LOGIN => {
            let mut login = LoginRequest {
                username: String::new(),
                password_digest: String::new(),
            };
            for field in Reader::new(body) {
                let field = field?;
                match field.number {
                    1 => login.username = field.as_str("username")?.to_string(),
                    2 => login.password_digest = field.as_str("password_digest")?.to_string(),
                    _ => {}
                }
            }
            Payload::Login(login)
        }
        PAYLOAD_OUTCOME => {
            let mut outcome = Outcome::default();
            for field in Reader::new(body) {
                let field = field?;
                match field.number {
                    1 => outcome.ok = field.as_bool("ok")?,
                    2 => outcome.message = field.as_str("message")?.to_string(),
                    _ => {}
                }
            }
            Payload::Outcome(outcome)
        }
        PAYLOAD_SNAPSHOT_REQUEST => {
            let mut oid = None;
            for field in Reader::new(body) {
                let field = field?;
                if field.number == 1 {
                    oid = Some(parse_oid(field.as_str("oid")?)?);
                }
            }
            let oid = oid.ok_or_else(|| WireError::malformed("snapshot request without oid"))?;
            Payload::SnapshotRequest(SnapshotRequest { oid })
        }
        PAYLOAD_SNAPSHOT_RESPONSE => Payload::SnapshotResponse(SnapshotResponse {
            record: decode_embedded_record(body)?,
        }),
        PAYLOAD_STREAM_START => Payload::StreamStart(decode_stream_start(body)?),
        PAYLOAD_STREAM_STOP => Payload::StreamStop(StreamStop {
            stream_id: decode_stream_id(body)?,
        }),
        PAYLOAD_STREAM_DATA => {
            let mut stream_id = None;
            let mut data = Bytes::new();
            for field in Reader::new(body) {
                let field = field?;
                match field.number {
                    1 => stream_id = Some(field.as_sint32("stream_id")?),
                    2 => data = Bytes::copy_from_slice(field.as_bytes("data")?),
                    _ => {}
                }
            }
            let stream_id =
                stream_id.ok_or_else(|| WireError::malformed("stream data without stream id"))?;
            Payload::StreamData(StreamData { stream_id, data })
        }
        PAYLOAD_UPDATE_PUSH => Payload::UpdatePush(UpdatePush {
            record: decode_embedded_record(body)?,
        }),
        PAYLOAD_PLUGIN => {
            let mut plugin = PluginPayload {
                type_tag: String::new(),
                data: Bytes::new(),
            };
            for field in Reader::new(body) {
                let field = field?;
                match field.number {
                    1 => plugin.type_tag = field.as_str("type_tag")?.to_string(),
                    2 => plugin.data = Bytes::copy_from_slice(field.as_bytes("data")?),
                    _ => {}
                }
            }
            Payload::Plugin(plugin)
        }
        _ => return Ok(Payload::Unknown(field.into_raw())),
    };
    Ok(payload)
}

fn decode_identity_request(body: &[u8]) -> Result<IdentityRequest, WireError> {
    let mut uuid = None;
    let mut instance_type = InstanceType::Client;
    let mut instance_flavor = InstanceFlavor::Standard;
    for field in Reader::new(body) {
        let field = field?;
        match field.number {
            1 => uuid = Some(parse_uuid(field.as_str("uuid")?)?),
            2 => {
                instance_type = InstanceType::from_code(field.as_u32("instance_type")?)
                    .ok_or(WireError::ValueOutOfRange {
                        field: "instance_type",
                    })?
            }
            3 => {
                instance_flavor = InstanceFlavor::from_code(field.as_u32("instance_flavor")?)
                    .ok_or(WireError::ValueOutOfRange {
                        field: "instance_flavor",
                    })?
            }
            _ => {}
        }
    }
    Ok(IdentityRequest {
        uuid: uuid.ok_or_else(|| WireError::malformed("identity request without uuid"))?,
        instance_type,
        instance_flavor,
    })
}

fn decode_identity_response(body: &[u8]) -> Result<IdentityResponse, WireError> {
    let mut cvid = None;
    let mut server_cvid = 0;
    let mut server_uuid = Uuid::nil();
    for field in Reader::new(body) {
        let field = field?;
        match field.number {
            1 => cvid = Some(field.as_sint32("cvid")?),
            2 => server_cvid = field.as_sint32("server_cvid")?,
            3 => server_uuid = parse_uuid(field.as_str("server_uuid")?)?,
            _ => {}
        }
    }
    Ok(IdentityResponse {
        cvid: cvid.ok_or_else(|| WireError::malformed("identity response without cvid"))?,
        server_cvid,
        server_uuid,
    })
}

fn decode_stream_start(body: &[u8]) -> Result<StreamStart, WireError> {
    let mut stream_id = None;
    let mut code = None;
    let mut plugin = None;
    let mut oid = None;
    let mut params = Bytes::new();
    for field in Reader::new(body) {
        let field = field?;
        match field.number {
            1 => stream_id = Some(field.as_sint32("stream_id")?),
            2 => code = Some(field.as_u64("kind")?),
            3 => plugin = Some(field.as_str("plugin_kind")?.to_string()),
            4 => oid = Some(parse_oid(field.as_str("oid")?)?),
            5 => params = Bytes::copy_from_slice(field.as_bytes("params")?),
            _ => {}
        }
    }
    let kind = match (code, plugin) {
        (Some(1), _) => StreamKind::StateSync,
        (Some(2), _) => StreamKind::ProfileEvents,
        (Some(3), _) => StreamKind::Screenshot,
        (Some(4), _) => StreamKind::Shell,
        (Some(PLUGIN_STREAM_CODE), Some(name)) => StreamKind::Plugin(name),
        (Some(PLUGIN_STREAM_CODE), None) => {
            return Err(WireError::malformed("plugin stream without a kind name"));
        }
        (Some(_), _) => return Err(WireError::ValueOutOfRange { field: "kind" }),
        (None, _) => return Err(WireError::malformed("stream start without kind")),
    };
    Ok(StreamStart {
        stream_id: stream_id
            .ok_or_else(|| WireError::malformed("stream start without stream id"))?,
        kind,
        oid,
        params,
    })
}

fn decode_stream_id(body: &[u8]) -> Result<i32, WireError> {
    for field in Reader::new(body) {
        let field = field?;
        if field.number == 1 {
            return field.as_sint32("stream_id");
        }
    }
    Err(WireError::malformed("stream stop without stream id"))
}

fn decode_embedded_record(body: &[u8]) -> Result<state_tree::UpdateRecord, WireError> {
    for field in Reader::new(body) {
        let field = field?;
        if field.number == 1 {
            return record_codec::decode(field.as_bytes("record")?);
        }
    }
    Ok(state_tree::UpdateRecord::new())
}

fn parse_oid(text: &str) -> Result<Oid, WireError> {
    Oid::parse(text).map_err(|err| WireError::malformed(err.to_string()))
}

fn parse_uuid(text: &str) -> Result<Uuid, WireError> {
    Uuid::parse_str(text).map_err(|err| WireError::malformed(format!("invalid uuid: {err}")))
}
