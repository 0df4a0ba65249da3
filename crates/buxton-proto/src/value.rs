//! Typed values and access-control labels.

use std::fmt;

use crate::wire::WireError;

/// Discriminant for the supported value types.
///
/// The numeric representation is the wire encoding; it never changes once
/// published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DataType {
    /// UTF-8 string, NUL-terminated on the wire.
    String = 1,
    /// Signed 32-bit integer.
    Int32 = 2,
    /// Unsigned 32-bit integer.
    Uint32 = 3,
    /// Signed 64-bit integer.
    Int64 = 4,
    /// Unsigned 64-bit integer.
    Uint64 = 5,
    /// IEEE-754 single-precision float.
    Float = 6,
    /// IEEE-754 double-precision float.
    Double = 7,
    /// Boolean, one byte on the wire.
    Boolean = 8,
}

impl DataType {
    /// Maps a wire identifier back to a data type.
    #[must_use]
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::String),
            2 => Some(Self::Int32),
            3 => Some(Self::Uint32),
            4 => Some(Self::Int64),
            5 => Some(Self::Uint64),
            6 => Some(Self::Float),
            7 => Some(Self::Double),
            8 => Some(Self::Boolean),
            _ => None,
        }
    }

    /// Returns the wire identifier for this type.
    #[must_use]
    pub fn wire_id(self) -> u32 {
        self as u32
    }

    /// Returns the fixed payload width, or `None` for strings.
    #[must_use]
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            Self::String => None,
            Self::Int32 | Self::Uint32 | Self::Float => Some(4),
            Self::Int64 | Self::Uint64 | Self::Double => Some(8),
            Self::Boolean => Some(1),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::String => "string",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Float => "float",
            Self::Double => "double",
            Self::Boolean => "bool",
        };
        formatter.write_str(label)
    }
}

/// A single stored or transmitted value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Float(f32),
    Double(f64),
    Boolean(bool),
}

impl Value {
    /// Returns the type discriminant of this value.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::String(_) => DataType::String,
            Self::Int32(_) => DataType::Int32,
            Self::Uint32(_) => DataType::Uint32,
            Self::Int64(_) => DataType::Int64,
            Self::Uint64(_) => DataType::Uint64,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::Boolean(_) => DataType::Boolean,
        }
    }

    /// Returns the serialized payload length, including the trailing NUL
    /// for strings.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::String(s) => s.len() + 1,
            other => other
                .data_type()
                .fixed_len()
                .unwrap_or_default(),
        }
    }

    /// Appends the wire payload for this value to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::EmbeddedNul`] when a string value contains a NUL
    /// byte, which the NUL-terminated wire encoding cannot carry.
    pub fn write_payload(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        match self {
            Self::String(s) => {
                if s.as_bytes().contains(&0) {
                    return Err(WireError::EmbeddedNul);
                }
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            Self::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Uint32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Uint64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Boolean(v) => out.push(u8::from(*v)),
        }
        Ok(())
    }

    /// Decodes a payload of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::PayloadLength`] when the payload width does not
    /// match the type, and [`WireError::InvalidUtf8`] for malformed string
    /// data.
    pub fn decode_payload(data_type: DataType, payload: &[u8]) -> Result<Self, WireError> {
        if let Some(expected) = data_type.fixed_len()
            && payload.len() != expected
        {
            return Err(WireError::PayloadLength {
                data_type,
                expected,
                actual: payload.len(),
            });
        }

        match data_type {
            DataType::String => {
                let Some((&0, text)) = payload.split_last() else {
                    return Err(WireError::PayloadLength {
                        data_type,
                        expected: 1,
                        actual: payload.len(),
                    });
                };
                let text = std::str::from_utf8(text).map_err(|_| WireError::InvalidUtf8)?;
                if text.as_bytes().contains(&0) {
                    return Err(WireError::EmbeddedNul);
                }
                Ok(Self::String(text.to_string()))
            }
            DataType::Int32 => Ok(Self::Int32(i32::from_le_bytes(fixed(data_type, payload)?))),
            DataType::Uint32 => Ok(Self::Uint32(u32::from_le_bytes(fixed(data_type, payload)?))),
            DataType::Int64 => Ok(Self::Int64(i64::from_le_bytes(fixed(data_type, payload)?))),
            DataType::Uint64 => Ok(Self::Uint64(u64::from_le_bytes(fixed(data_type, payload)?))),
            DataType::Float => Ok(Self::Float(f32::from_le_bytes(fixed(data_type, payload)?))),
            DataType::Double => Ok(Self::Double(f64::from_le_bytes(fixed(data_type, payload)?))),
            DataType::Boolean => match payload {
                [0] => Ok(Self::Boolean(false)),
                [1] => Ok(Self::Boolean(true)),
                _ => Err(WireError::InvalidBoolean),
            },
        }
    }

    /// Parses a textual representation as the requested type.
    ///
    /// Used by the command-line tool to turn shell arguments into values.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::ValueParse`] when the text does not parse as the
    /// requested type.
    pub fn parse_as(data_type: DataType, text: &str) -> Result<Self, WireError> {
        let parse_error = || WireError::ValueParse {
            data_type,
            input: text.to_string(),
        };
        match data_type {
            DataType::String => {
                if text.as_bytes().contains(&0) {
                    return Err(WireError::EmbeddedNul);
                }
                Ok(Self::String(text.to_string()))
            }
            DataType::Int32 => text.parse().map(Self::Int32).map_err(|_| parse_error()),
            DataType::Uint32 => text.parse().map(Self::Uint32).map_err(|_| parse_error()),
            DataType::Int64 => text.parse().map(Self::Int64).map_err(|_| parse_error()),
            DataType::Uint64 => text.parse().map(Self::Uint64).map_err(|_| parse_error()),
            DataType::Float => text.parse().map(Self::Float).map_err(|_| parse_error()),
            DataType::Double => text.parse().map(Self::Double).map_err(|_| parse_error()),
            DataType::Boolean => match text {
                "true" | "1" => Ok(Self::Boolean(true)),
                "false" | "0" => Ok(Self::Boolean(false)),
                _ => Err(parse_error()),
            },
        }
    }

    /// Returns the string content when this value is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => formatter.write_str(v),
            Self::Int32(v) => write!(formatter, "{v}"),
            Self::Uint32(v) => write!(formatter, "{v}"),
            Self::Int64(v) => write!(formatter, "{v}"),
            Self::Uint64(v) => write!(formatter, "{v}"),
            Self::Float(v) => write!(formatter, "{v}"),
            Self::Double(v) => write!(formatter, "{v}"),
            Self::Boolean(v) => write!(formatter, "{v}"),
        }
    }
}

fn fixed<const N: usize>(data_type: DataType, payload: &[u8]) -> Result<[u8; N], WireError> {
    payload.try_into().map_err(|_| WireError::PayloadLength {
        data_type,
        expected: N,
        actual: payload.len(),
    })
}

/// An access-control label attached to a stored record or a wire parameter.
///
/// Labels are opaque non-empty UTF-8 strings without embedded NUL bytes.
/// The daemon's default label is `"_"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label(String);

impl Label {
    /// The label assigned when a caller supplies none.
    pub const DEFAULT: &str = "_";

    /// Validates and wraps a label string.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidLabel`] for empty labels or labels with
    /// embedded NUL bytes.
    pub fn new(label: impl Into<String>) -> Result<Self, WireError> {
        let label = label.into();
        if label.is_empty() || label.as_bytes().contains(&0) {
            return Err(WireError::InvalidLabel);
        }
        Ok(Self(label))
    }

    /// Returns the label text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the serialized length, counting the trailing NUL.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.0.len() + 1
    }
}

impl Default for Label {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}
