use std::fmt;

use serde::{Deserialize, Serialize};

/// Tagged attribute value. An attribute holds at most one of these.
///
/// `List` carries scalars only and replicates by full replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bytes(Vec<u8>),
    String(String),
    Int32(i32),
    Int64(i64),
    Bool(bool),
    Double(f64),
    InstanceType(InstanceType),
    InstanceFlavor(InstanceFlavor),
    OsType(OsType),
    List(Vec<Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "bytes",
            Value::String(_) => "string",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Bool(_) => "bool",
            Value::Double(_) => "double",
            Value::InstanceType(_) => "instance_type",
            Value::InstanceFlavor(_) => "instance_flavor",
            Value::OsType(_) => "os_type",
            Value::List(_) => "list",
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(value) => Some(i64::from(*value)),
            Value::Int64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Value::String(value) => f.write_str(value),
            Value::Int32(value) => write!(f, "{value}"),
            Value::Int64(value) => write!(f, "{value}"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Double(value) => write!(f, "{value}"),
            Value::InstanceType(value) => write!(f, "{value:?}"),
            Value::InstanceFlavor(value) => write!(f, "{value:?}"),
            Value::OsType(value) => write!(f, "{value:?}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn code(self) -> u32 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// Role of a process participating in the protocol.
    InstanceType {
        Server = 0,
        Client = 1,
        Agent = 2,
    }
}

wire_enum! {
    /// Build variant of an instance within its type.
    InstanceFlavor {
        Standard = 0,
        Desktop = 1,
        Mobile = 2,
        Terminal = 3,
    }
}

wire_enum! {
    OsType {
        Unknown = 0,
        Linux = 1,
        Windows = 2,
        Macos = 3,
        FreeBsd = 4,
        Ios = 5,
        Android = 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn enum_codes_are_stable() {
        assert_eq!(InstanceType::Client.code(), 1);
        assert_eq!(InstanceType::from_code(2), Some(InstanceType::Agent));
        assert_eq!(InstanceType::from_code(9), None);
        assert_eq!(OsType::from_code(OsType::Ios.code()), Some(OsType::Ios));
        assert_eq!(InstanceFlavor::from_code(4), None);
    }

    #[test_timeout::timeout]
    fn widening_accessors() {
        assert_eq!(Value::Int32(-4).as_i64(), Some(-4));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::Bool(true).as_i64(), None);
        assert!(!Value::List(vec![]).is_scalar());
    }

    #[test_timeout::timeout]
    fn display_renders_lists() {
        let value = Value::List(vec![Value::Int32(1), Value::from("two")]);
        assert_eq!(value.to_string(), "[1, two]");
    }
}
