//! Binary encoding of [`UpdateRecord`]s.
//!
//! ```text
//! UpdateRecord { repeated Entry entries = 1; }
//! Entry        { string path = 1; Value value = 2; sint64 timestamp = 3; }
//! Value        { oneof: bytes = 1, string = 2, sint32 = 3, sint64 = 4,
//!                bool = 5, double = 6, instance_type = 7,
//!                instance_flavor = 8, os_type = 9, List list = 10 }
//! List         { repeated Value items = 1; }
//! ```
//!
//! An entry without a value clears the attribute. An entry whose value has
//! no recognised kind is kept opaque: the whole value field is retained and
//! written back unchanged.

pub mod wire;

use std::collections::btree_map::Entry as MapEntry;

use crate::attribute::Timestamp;
use crate::oid::Oid;
use crate::update::{AttributeChange, UpdateRecord};
use crate::value::{InstanceFlavor, InstanceType, OsType, Value};

use wire::{Field, Reader, WireError, Writer};

const RECORD_ENTRY: u32 = 1;

const ENTRY_PATH: u32 = 1;
const ENTRY_VALUE: u32 = 2;
const ENTRY_TIMESTAMP: u32 = 3;

const VALUE_BYTES: u32 = 1;
const VALUE_STRING: u32 = 2;
const VALUE_INT32: u32 = 3;
const VALUE_INT64: u32 = 4;
const VALUE_BOOL: u32 = 5;
const VALUE_DOUBLE: u32 = 6;
const VALUE_INSTANCE_TYPE: u32 = 7;
const VALUE_INSTANCE_FLAVOR: u32 = 8;
const VALUE_OS_TYPE: u32 = 9;
const VALUE_LIST: u32 = 10;

const LIST_ITEM: u32 = 1;

pub fn encode(record: &UpdateRecord) -> Vec<u8> {
    let mut writer = Writer::with_capacity(32 * record.len().max(1));
    write_record(&mut writer, record);
    writer.into_bytes()
}

/// Appends `record`'s fields to `writer`; used when a record is embedded in
/// another message.
pub fn write_record(writer: &mut Writer, record: &UpdateRecord) {
    for (oid, change) in &record.entries {
        writer.message(RECORD_ENTRY, |entry| {
            entry.string(ENTRY_PATH, &oid.to_string());
            if let Some(value) = &change.value {
                entry.message(ENTRY_VALUE, |out| write_value(out, value));
            }
            if let Some(timestamp) = change.timestamp {
                entry.sint64(ENTRY_TIMESTAMP, timestamp.as_millis());
            }
            entry.raw_all(&change.unknown);
        });
    }
    writer.raw_all(&record.unknown);
}

fn write_value(writer: &mut Writer, value: &Value) {
    match value {
        Value::Bytes(bytes) => writer.bytes(VALUE_BYTES, bytes),
        Value::String(text) => writer.string(VALUE_STRING, text),
        Value::Int32(number) => writer.sint32(VALUE_INT32, *number),
        Value::Int64(number) => writer.sint64(VALUE_INT64, *number),
        Value::Bool(flag) => writer.bool(VALUE_BOOL, *flag),
        Value::Double(number) => writer.double(VALUE_DOUBLE, *number),
        Value::InstanceType(kind) => writer.varint(VALUE_INSTANCE_TYPE, u64::from(kind.code())),
        Value::InstanceFlavor(flavor) => {
            writer.varint(VALUE_INSTANCE_FLAVOR, u64::from(flavor.code()))
        }
        Value::OsType(os) => writer.varint(VALUE_OS_TYPE, u64::from(os.code())),
        Value::List(items) => writer.message(VALUE_LIST, |list| {
            for item in items {
                list.message(LIST_ITEM, |out| write_value(out, item));
            }
        }),
    }
}

pub fn decode(bytes: &[u8]) -> Result<UpdateRecord, WireError> {
    let mut record = UpdateRecord::new();
    let mut reader = Reader::new(bytes);
    while let Some(field) = reader.next_field()? {
        if field.number == RECORD_ENTRY {
            let (oid, change) = decode_entry(field.as_bytes("entry")?)?;
            match record.entries.entry(oid) {
                MapEntry::Occupied(existing) => {
                    return Err(WireError::malformed(format!(
                        "duplicate path {} in update record",
                        existing.key()
                    )));
                }
                MapEntry::Vacant(slot) => {
                    slot.insert(change);
                }
            }
        } else {
            record.unknown.push(field.into_raw());
        }
    }
    Ok(record)
}

fn decode_entry(bytes: &[u8]) -> Result<(Oid, AttributeChange), WireError> {
    let mut path = None;
    let mut change = AttributeChange::default();
    let mut reader = Reader::new(bytes);
    while let Some(field) = reader.next_field()? {
        match field.number {
            ENTRY_PATH => {
                let text = field.as_str("path")?;
                let oid = Oid::parse(text).map_err(|err| WireError::malformed(err.to_string()))?;
                path = Some(oid);
            }
            ENTRY_VALUE => match decode_value(field.as_bytes("value")?, false)? {
                Some(value) => change.value = Some(value),
                None => {
                    change.opaque = true;
                    change.unknown.push(field.into_raw());
                }
            },
            ENTRY_TIMESTAMP => {
                change.timestamp = Some(Timestamp(field.as_sint64("timestamp")?));
            }
            _ => change.unknown.push(field.into_raw()),
        }
    }
    let path = path.ok_or_else(|| WireError::malformed("update entry without a path"))?;
    Ok((path, change))
}

/// Decodes one value message. `Ok(None)` means the message only carried
/// kinds this build does not know.
fn decode_value(bytes: &[u8], in_list: bool) -> Result<Option<Value>, WireError> {
    let mut value = None;
    let mut saw_unknown = false;
    let mut reader = Reader::new(bytes);
    while let Some(field) = reader.next_field()? {
        let decoded = match field.number {
            VALUE_BYTES => Value::Bytes(field.as_bytes("bytes")?.to_vec()),
            VALUE_STRING => Value::String(field.as_str("string")?.to_string()),
            VALUE_INT32 => Value::Int32(field.as_sint32("int32")?),
            VALUE_INT64 => Value::Int64(field.as_sint64("int64")?),
            VALUE_BOOL => Value::Bool(field.as_bool("bool")?),
            VALUE_DOUBLE => Value::Double(field.as_double("double")?),
            VALUE_INSTANCE_TYPE => Value::InstanceType(enum_code(
                &field,
                "instance_type",
                InstanceType::from_code,
            )?),
            VALUE_INSTANCE_FLAVOR => Value::InstanceFlavor(enum_code(
                &field,
                "instance_flavor",
                InstanceFlavor::from_code,
            )?),
            VALUE_OS_TYPE => Value::OsType(enum_code(&field, "os_type", OsType::from_code)?),
            VALUE_LIST => {
                if in_list {
                    return Err(WireError::malformed("nested list value"));
                }
                Value::List(decode_list(field.as_bytes("list")?)?)
            }
            _ => {
                saw_unknown = true;
                continue;
            }
        };
        if value.replace(decoded).is_some() {
            return Err(WireError::malformed("value carries more than one kind"));
        }
    }
    match (value, saw_unknown) {
        (Some(value), _) => Ok(Some(value)),
        (None, true) => Ok(None),
        (None, false) => Err(WireError::malformed("value carries no kind")),
    }
}

fn decode_list(bytes: &[u8]) -> Result<Vec<Value>, WireError> {
    let mut items = Vec::new();
    let mut reader = Reader::new(bytes);
    while let Some(field) = reader.next_field()? {
        if field.number != LIST_ITEM {
            continue;
        }
        match decode_value(field.as_bytes("list item")?, true)? {
            Some(item) => items.push(item),
            None => return Err(WireError::malformed("list item of unknown kind")),
        }
    }
    Ok(items)
}

fn enum_code<T>(
    field: &Field<'_>,
    name: &'static str,
    from_code: fn(u32) -> Option<T>,
) -> Result<T, WireError> {
    from_code(field.as_u32(name)?).ok_or(WireError::ValueOutOfRange { field: name })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(text: &str) -> Oid {
        Oid::parse(text).expect("valid oid")
    }

    fn entry_bytes(build: impl FnOnce(&mut Writer)) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.message(RECORD_ENTRY, build);
        writer.into_bytes()
    }

    #[test_timeout::timeout]
    fn every_value_kind_survives_the_codec() {
        let record = UpdateRecord::new()
            .with(oid("/a/bytes"), AttributeChange::set(Value::Bytes(vec![0, 1, 255])))
            .with(oid("/a/string"), AttributeChange::set("desktop-1"))
            .with(oid("/a/int32"), AttributeChange::set(i32::MIN))
            .with(oid("/a/int64"), AttributeChange::set(-7_i64).at(Timestamp(1_700_000_000_000)))
            .with(oid("/a/bool"), AttributeChange::set(true))
            .with(oid("/a/double"), AttributeChange::set(0.25))
            .with(oid("/a/type"), AttributeChange::set(Value::InstanceType(InstanceType::Agent)))
            .with(
                oid("/a/flavor"),
                AttributeChange::set(Value::InstanceFlavor(InstanceFlavor::Terminal)),
            )
            .with(oid("ns:/a/os"), AttributeChange::set(Value::OsType(OsType::Linux)))
            .with(
                oid("/a/list"),
                AttributeChange::set(Value::List(vec![Value::from(1), Value::from("x")])),
            )
            .with(oid("/a/cleared"), AttributeChange::clear().at(Timestamp(5)));

        let decoded = decode(&encode(&record)).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test_timeout::timeout]
    fn unknown_fields_are_preserved() {
        let mut bytes = entry_bytes(|entry| {
            entry.string(ENTRY_PATH, "/profile/abc/hostname");
            entry.message(ENTRY_VALUE, |value| value.string(VALUE_STRING, "desktop-1"));
            entry.varint(9, 77);
        });
        let mut trailer = Writer::new();
        trailer.string(15, "future");
        bytes.extend_from_slice(trailer.as_slice());

        let record = decode(&bytes).expect("decode");
        let change = record.get(&oid("/profile/abc/hostname")).expect("entry");
        assert_eq!(change.value, Some(Value::from("desktop-1")));
        assert_eq!(change.unknown.len(), 1);
        assert_eq!(record.unknown.len(), 1);
        assert_eq!(encode(&record), bytes);
    }

    #[test_timeout::timeout]
    fn unknown_value_kind_is_opaque() {
        let bytes = entry_bytes(|entry| {
            entry.string(ENTRY_PATH, "/a");
            entry.message(ENTRY_VALUE, |value| value.bytes(30, b"geo"));
        });
        let record = decode(&bytes).expect("decode");
        let change = record.get(&oid("/a")).unwrap();
        assert!(change.is_opaque());
        assert!(change.value.is_none());
        assert_eq!(encode(&record), bytes);
    }

    #[test_timeout::timeout]
    fn int32_overflow_is_out_of_range() {
        let bytes = entry_bytes(|entry| {
            entry.string(ENTRY_PATH, "/a");
            entry.message(ENTRY_VALUE, |value| value.sint64(VALUE_INT32, 1 << 40));
        });
        assert_eq!(
            decode(&bytes).unwrap_err(),
            WireError::ValueOutOfRange { field: "int32" }
        );
    }

    #[test_timeout::timeout]
    fn unknown_enum_code_is_out_of_range() {
        let bytes = entry_bytes(|entry| {
            entry.string(ENTRY_PATH, "/a");
            entry.message(ENTRY_VALUE, |value| value.varint(VALUE_OS_TYPE, 99));
        });
        assert_eq!(
            decode(&bytes).unwrap_err(),
            WireError::ValueOutOfRange { field: "os_type" }
        );
    }

    #[test_timeout::timeout]
    fn rejects_structural_errors() {
        let duplicate = {
            let mut bytes = entry_bytes(|entry| entry.string(ENTRY_PATH, "/a"));
            bytes.extend(entry_bytes(|entry| entry.string(ENTRY_PATH, "a")));
            bytes
        };
        let two_kinds = entry_bytes(|entry| {
            entry.string(ENTRY_PATH, "/a");
            entry.message(ENTRY_VALUE, |value| {
                value.bool(VALUE_BOOL, true);
                value.string(VALUE_STRING, "x");
            });
        });
        let nested_list = entry_bytes(|entry| {
            entry.string(ENTRY_PATH, "/a");
            entry.message(ENTRY_VALUE, |value| {
                value.message(VALUE_LIST, |list| {
                    list.message(LIST_ITEM, |item| {
                        item.message(VALUE_LIST, |_| {});
                    });
                });
            });
        });
        let no_path = entry_bytes(|entry| entry.sint64(ENTRY_TIMESTAMP, 1));
        let bad_path = entry_bytes(|entry| entry.string(ENTRY_PATH, "/a//b"));

        for bytes in [duplicate, two_kinds, nested_list, no_path, bad_path] {
            assert!(
                matches!(decode(&bytes), Err(WireError::MalformedMessage(_))),
                "{bytes:?}"
            );
        }
    }

    #[test_timeout::timeout]
    fn truncated_record_fails() {
        let record = UpdateRecord::new().with(oid("/a/b"), AttributeChange::set("value"));
        let bytes = encode(&record);
        assert_eq!(
            decode(&bytes[..bytes.len() - 1]).unwrap_err(),
            WireError::UnexpectedEof
        );
    }
}
