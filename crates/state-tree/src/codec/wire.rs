//! Tag/length/value primitives shared by the update codec and the session
//! envelope.
//!
//! The layout is protobuf compatible: every field starts with a varint key
//! `(number << 3) | wire_type`. Fields this build does not recognise are kept
//! as [`RawField`]s so they can be written back out unchanged.

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_FIXED64: u8 = 1;
pub const WIRE_LEN: u8 = 2;
pub const WIRE_FIXED32: u8 = 5;

const MAX_FIELD_NUMBER: u64 = (1 << 29) - 1;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("value out of range for field {field}")]
    ValueOutOfRange { field: &'static str },
}

impl WireError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        WireError::MalformedMessage(reason.into())
    }
}

/// An undecoded field, retained for forward compatibility.
///
/// `data` holds the value bytes without the key; for length-delimited fields
/// it excludes the length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub number: u32,
    pub wire_type: u8,
    pub data: Vec<u8>,
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Number of bytes `value` occupies as a varint.
pub fn var_u64_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn key(&mut self, number: u32, wire_type: u8) {
        write_var_u64(&mut self.buf, (u64::from(number) << 3) | u64::from(wire_type));
    }

    pub fn varint(&mut self, number: u32, value: u64) {
        self.key(number, WIRE_VARINT);
        write_var_u64(&mut self.buf, value);
    }

    pub fn sint32(&mut self, number: u32, value: i32) {
        self.sint64(number, i64::from(value));
    }

    pub fn sint64(&mut self, number: u32, value: i64) {
        self.varint(number, zigzag_encode(value));
    }

    pub fn bool(&mut self, number: u32, value: bool) {
        self.varint(number, u64::from(value));
    }

    pub fn double(&mut self, number: u32, value: f64) {
        self.key(number, WIRE_FIXED64);
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn bytes(&mut self, number: u32, value: &[u8]) {
        self.key(number, WIRE_LEN);
        write_var_u64(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    pub fn string(&mut self, number: u32, value: &str) {
        self.bytes(number, value.as_bytes());
    }

    /// Writes a nested message built by `build`.
    pub fn message(&mut self, number: u32, build: impl FnOnce(&mut Writer)) {
        let mut nested = Writer::new();
        build(&mut nested);
        self.bytes(number, &nested.buf);
    }

    pub fn raw(&mut self, field: &RawField) {
        self.key(field.number, field.wire_type);
        if field.wire_type == WIRE_LEN {
            write_var_u64(&mut self.buf, field.data.len() as u64);
        }
        self.buf.extend_from_slice(&field.data);
    }

    pub fn raw_all(&mut self, fields: &[RawField]) {
        for field in fields {
            self.raw(field);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

/// One decoded field borrowed from the input.
#[derive(Debug, Clone, Copy)]
pub struct Field<'a> {
    pub number: u32,
    pub wire_type: u8,
    pub value: FieldValue<'a>,
    raw: &'a [u8],
}

impl<'a> Field<'a> {
    pub fn into_raw(self) -> RawField {
        RawField {
            number: self.number,
            wire_type: self.wire_type,
            data: self.raw.to_vec(),
        }
    }

    pub fn as_u64(&self, field: &'static str) -> Result<u64, WireError> {
        match self.value {
            FieldValue::Varint(value) => Ok(value),
            _ => Err(self.mismatch(field)),
        }
    }

    pub fn as_u32(&self, field: &'static str) -> Result<u32, WireError> {
        u32::try_from(self.as_u64(field)?).map_err(|_| WireError::ValueOutOfRange { field })
    }

    pub fn as_sint64(&self, field: &'static str) -> Result<i64, WireError> {
        Ok(zigzag_decode(self.as_u64(field)?))
    }

    pub fn as_sint32(&self, field: &'static str) -> Result<i32, WireError> {
        i32::try_from(self.as_sint64(field)?).map_err(|_| WireError::ValueOutOfRange { field })
    }

    pub fn as_bool(&self, field: &'static str) -> Result<bool, WireError> {
        match self.as_u64(field)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::ValueOutOfRange { field }),
        }
    }

    pub fn as_double(&self, field: &'static str) -> Result<f64, WireError> {
        match self.value {
            FieldValue::Fixed64(bits) => Ok(f64::from_bits(bits)),
            _ => Err(self.mismatch(field)),
        }
    }

    pub fn as_bytes(&self, field: &'static str) -> Result<&'a [u8], WireError> {
        match self.value {
            FieldValue::Bytes(bytes) => Ok(bytes),
            _ => Err(self.mismatch(field)),
        }
    }

    pub fn as_str(&self, field: &'static str) -> Result<&'a str, WireError> {
        std::str::from_utf8(self.as_bytes(field)?)
            .map_err(|_| WireError::malformed(format!("{field} is not valid utf-8")))
    }

    fn mismatch(&self, field: &'static str) -> WireError {
        WireError::malformed(format!(
            "{field} has unexpected wire type {}",
            self.wire_type
        ))
    }
}

/// Sequential field reader over one encoded message.
#[derive(Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(len).ok_or(WireError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads the next field, or `None` at a clean end of input.
    pub fn next_field(&mut self) -> Result<Option<Field<'a>>, WireError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let key = self.read_var_u64()?;
        let number = key >> 3;
        if number == 0 || number > MAX_FIELD_NUMBER {
            return Err(WireError::malformed(format!("invalid field number {number}")));
        }
        let wire_type = (key & 0x7) as u8;
        let start = self.pos;
        let (value, raw) = match wire_type {
            WIRE_VARINT => {
                let value = self.read_var_u64()?;
                let bytes = self.bytes;
                (FieldValue::Varint(value), &bytes[start..self.pos])
            }
            WIRE_FIXED64 => {
                let raw = self.read_bytes(8)?;
                let mut le = [0u8; 8];
                le.copy_from_slice(raw);
                (FieldValue::Fixed64(u64::from_le_bytes(le)), raw)
            }
            WIRE_LEN => {
                let len = self.read_var_u64()?;
                let len = usize::try_from(len).map_err(|_| WireError::UnexpectedEof)?;
                let raw = self.read_bytes(len)?;
                (FieldValue::Bytes(raw), raw)
            }
            WIRE_FIXED32 => {
                let raw = self.read_bytes(4)?;
                let mut le = [0u8; 4];
                le.copy_from_slice(raw);
                (FieldValue::Fixed32(u32::from_le_bytes(le)), raw)
            }
            other => {
                return Err(WireError::malformed(format!("unsupported wire type {other}")));
            }
        };
        Ok(Some(Field {
            number: number as u32,
            wire_type,
            value,
            raw,
        }))
    }
}

impl<'a> Iterator for Reader<'a> {
    type Item = Result<Field<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_field() {
            Ok(Some(field)) => Some(Ok(field)),
            Ok(None) => None,
            Err(err) => {
                // stop after the first error
                self.pos = self.bytes.len();
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn zigzag_matches_protobuf() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MIN)), i64::MIN);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MAX)), i64::MAX);
    }

    #[test_timeout::timeout]
    fn varint_lengths() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_var_u64(&mut buf, value);
            assert_eq!(buf.len(), var_u64_len(value), "{value}");
            assert_eq!(Reader::new(&buf).read_var_u64().unwrap(), value);
        }
    }

    #[test_timeout::timeout]
    fn reads_fields_in_order() {
        let mut writer = Writer::new();
        writer.sint32(1, -5);
        writer.string(2, "hostname");
        writer.double(3, 1.5);
        let bytes = writer.into_bytes();

        let fields: Vec<_> = Reader::new(&bytes).collect::<Result<_, _>>().unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].as_sint32("a").unwrap(), -5);
        assert_eq!(fields[1].as_str("b").unwrap(), "hostname");
        assert_eq!(fields[2].as_double("c").unwrap(), 1.5);
    }

    #[test_timeout::timeout]
    fn raw_fields_re_emit_verbatim() {
        let mut writer = Writer::new();
        writer.varint(40, 300);
        writer.bytes(41, b"opaque");
        writer.key(42, WIRE_FIXED32);
        writer.buf.extend_from_slice(&7u32.to_le_bytes());
        let original = writer.into_bytes();

        let mut copy = Writer::new();
        for field in Reader::new(&original) {
            copy.raw(&field.unwrap().into_raw());
        }
        assert_eq!(copy.into_bytes(), original);
    }

    #[test_timeout::timeout]
    fn wide_values_are_out_of_range() {
        let mut writer = Writer::new();
        writer.sint64(1, i64::from(i32::MAX) + 1);
        writer.varint(2, 2);
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        let first = reader.next_field().unwrap().unwrap();
        assert_eq!(
            first.as_sint32("id"),
            Err(WireError::ValueOutOfRange { field: "id" })
        );
        let second = reader.next_field().unwrap().unwrap();
        assert_eq!(
            second.as_bool("flag"),
            Err(WireError::ValueOutOfRange { field: "flag" })
        );
    }

    #[test_timeout::timeout]
    fn truncated_input_is_eof() {
        let mut writer = Writer::new();
        writer.string(1, "hostname");
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes[..bytes.len() - 2]);
        assert_eq!(reader.next_field().unwrap_err(), WireError::UnexpectedEof);

        let overlong = [0xFFu8; 11];
        assert_eq!(
            Reader::new(&overlong).read_var_u64().unwrap_err(),
            WireError::VarIntOverflow
        );
    }

    #[test_timeout::timeout]
    fn rejects_reserved_wire_types() {
        let bytes = [(1u8 << 3) | 3, 0];
        assert!(matches!(
            Reader::new(&bytes).next_field(),
            Err(WireError::MalformedMessage(_))
        ));
    }
}
