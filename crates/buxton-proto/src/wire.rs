//! Frame encoding and decoding.
//!
//! The codec is deliberately strict: every length field is bounds-checked
//! before use, and a frame that violates any cap, carries an unknown type,
//! or declares lengths inconsistent with its byte count is rejected without
//! being partially interpreted.

use thiserror::Error;

use crate::key::KeyError;
use crate::message::{Direction, MessageType};
use crate::value::{DataType, Label, Value};

/// Magic number opening every frame.
pub const MAGIC: u32 = 0x672;

/// Serialized header length: magic, total length, message type, msgid and
/// parameter count.
pub const HEADER_LEN: usize = 24;

/// Upper bound on a whole frame, header included.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Upper bound on the number of parameters in one frame.
pub const MAX_PARAMS: usize = 16;

/// Minimum serialized parameter: type and two length fields, a one-byte
/// label with its NUL, and a one-byte value.
pub const MIN_PARAM_LEN: usize = 15;

/// Errors raised by the codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Frame does not start with the protocol magic.
    #[error("bad magic 0x{found:x}")]
    BadMagic { found: u32 },
    /// Frame is shorter than its declared or minimum length.
    #[error("truncated frame: have {actual} bytes, need {needed}")]
    Truncated { needed: usize, actual: usize },
    /// Declared total length disagrees with the bytes presented.
    #[error("frame length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    /// Frame or declared length exceeds [`MAX_MESSAGE_LEN`].
    #[error("frame of {0} bytes exceeds the {MAX_MESSAGE_LEN} byte cap")]
    Oversize(usize),
    /// Parameter count exceeds [`MAX_PARAMS`].
    #[error("{0} parameters exceed the {MAX_PARAMS} parameter cap")]
    TooManyParams(usize),
    /// Message type id is not part of the protocol.
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
    /// Message type is not legal for the direction being decoded.
    #[error("message type '{message_type}' not permitted in this direction")]
    ForbiddenMessageType { message_type: MessageType },
    /// Value type id is not part of the protocol.
    #[error("unknown value type {0}")]
    UnknownDataType(u32),
    /// A parameter's label failed validation.
    #[error("invalid parameter label")]
    InvalidLabel,
    /// A string payload carried an embedded NUL byte.
    #[error("string payload contains a NUL byte")]
    EmbeddedNul,
    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
    /// A fixed-width payload had the wrong length.
    #[error("{data_type} payload of {actual} bytes, expected {expected}")]
    PayloadLength {
        data_type: DataType,
        expected: usize,
        actual: usize,
    },
    /// A boolean payload was neither 0 nor 1.
    #[error("boolean payload out of range")]
    InvalidBoolean,
    /// Textual input did not parse as the requested type.
    #[error("'{input}' does not parse as {data_type}")]
    ValueParse { data_type: DataType, input: String },
    /// A key embedded in a message failed validation.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// One typed parameter: a value and the label attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Label carried alongside the value.
    pub label: Label,
    /// The value itself.
    pub value: Value,
}

impl Param {
    /// Pairs a value with a label.
    #[must_use]
    pub fn new(label: Label, value: Value) -> Self {
        Self { label, value }
    }

    /// Pairs a value with the default label.
    ///
    /// Request parameters carry placeholder labels; the daemon derives real
    /// labels from the peer, never from the frame.
    #[must_use]
    pub fn plain(value: Value) -> Self {
        Self {
            label: Label::default(),
            value,
        }
    }

    fn encoded_len(&self) -> usize {
        12 + self.label.encoded_len() + self.value.encoded_len()
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Control message type.
    pub msg_type: MessageType,
    /// Correlation id chosen by the requesting client.
    pub msgid: u64,
    /// Typed parameters, at most [`MAX_PARAMS`].
    pub params: Vec<Param>,
}

impl Message {
    /// Builds a frame in memory; caps are enforced by [`encode`].
    #[must_use]
    pub fn new(msg_type: MessageType, msgid: u64, params: Vec<Param>) -> Self {
        Self {
            msg_type,
            msgid,
            params,
        }
    }
}

/// Inspects a partial read buffer for a complete frame length.
///
/// Returns `Ok(None)` until the first eight header bytes are available.
///
/// # Errors
///
/// Fails when the magic does not match or the declared length is outside
/// the legal range, both of which mean the stream is unrecoverable.
pub fn peek_size(buf: &[u8]) -> Result<Option<usize>, WireError> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let magic = read_u32(buf, 0);
    if magic != MAGIC {
        return Err(WireError::BadMagic { found: magic });
    }
    let total = read_u32(buf, 4) as usize;
    if total > MAX_MESSAGE_LEN {
        return Err(WireError::Oversize(total));
    }
    if total < HEADER_LEN {
        return Err(WireError::LengthMismatch {
            declared: total,
            actual: HEADER_LEN,
        });
    }
    Ok(Some(total))
}

/// Serializes a message into a wire frame.
///
/// # Errors
///
/// Fails when the message exceeds the parameter or size caps, or when a
/// string payload cannot be encoded.
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    if message.params.len() > MAX_PARAMS {
        return Err(WireError::TooManyParams(message.params.len()));
    }

    let mut total = HEADER_LEN;
    for param in &message.params {
        total += param.encoded_len();
    }
    if total > MAX_MESSAGE_LEN {
        return Err(WireError::Oversize(total));
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&message.msg_type.wire_id().to_le_bytes());
    out.extend_from_slice(&message.msgid.to_le_bytes());
    out.extend_from_slice(&(message.params.len() as u32).to_le_bytes());

    for param in &message.params {
        out.extend_from_slice(&param.value.data_type().wire_id().to_le_bytes());
        out.extend_from_slice(&(param.label.encoded_len() as u32).to_le_bytes());
        out.extend_from_slice(&(param.value.encoded_len() as u32).to_le_bytes());
        out.extend_from_slice(param.label.as_str().as_bytes());
        out.push(0);
        param.value.write_payload(&mut out)?;
    }

    debug_assert_eq!(out.len(), total);
    Ok(out)
}

/// Deserializes a complete wire frame.
///
/// `direction` names the legal message set: frames read by the daemon must
/// carry request types, frames read by a client must carry response types.
///
/// # Errors
///
/// Fails on magic mismatch, length inconsistency, unknown or forbidden
/// message types, cap violations, and any malformed parameter.
pub fn decode(bytes: &[u8], direction: Direction) -> Result<Message, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated {
            needed: HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let magic = read_u32(bytes, 0);
    if magic != MAGIC {
        return Err(WireError::BadMagic { found: magic });
    }

    let declared = read_u32(bytes, 4) as usize;
    if declared > MAX_MESSAGE_LEN {
        return Err(WireError::Oversize(declared));
    }
    if declared != bytes.len() {
        return Err(WireError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    let raw_type = read_u32(bytes, 8);
    let msg_type =
        MessageType::from_wire(raw_type).ok_or(WireError::UnknownMessageType(raw_type))?;
    if !msg_type.permitted(direction) {
        return Err(WireError::ForbiddenMessageType {
            message_type: msg_type,
        });
    }

    let msgid = u64::from_le_bytes(
        bytes[12..20]
            .try_into()
            .map_err(|_| WireError::Truncated {
                needed: 20,
                actual: bytes.len(),
            })?,
    );

    let param_count = read_u32(bytes, 20) as usize;
    if param_count > MAX_PARAMS {
        return Err(WireError::TooManyParams(param_count));
    }

    let mut params = Vec::with_capacity(param_count);
    let mut cursor = HEADER_LEN;
    for _ in 0..param_count {
        let (param, next) = decode_param(bytes, cursor)?;
        params.push(param);
        cursor = next;
    }

    if cursor != bytes.len() {
        return Err(WireError::LengthMismatch {
            declared: cursor,
            actual: bytes.len(),
        });
    }

    Ok(Message {
        msg_type,
        msgid,
        params,
    })
}

fn decode_param(bytes: &[u8], start: usize) -> Result<(Param, usize), WireError> {
    let header_end = start.checked_add(12).ok_or(WireError::Oversize(start))?;
    if bytes.len() < header_end {
        return Err(WireError::Truncated {
            needed: header_end,
            actual: bytes.len(),
        });
    }

    let raw_type = read_u32(bytes, start);
    let data_type = DataType::from_wire(raw_type).ok_or(WireError::UnknownDataType(raw_type))?;
    let label_len = read_u32(bytes, start + 4) as usize;
    let value_len = read_u32(bytes, start + 8) as usize;

    if label_len < 2 {
        return Err(WireError::InvalidLabel);
    }
    if value_len == 0 {
        return Err(WireError::PayloadLength {
            data_type,
            expected: 1,
            actual: 0,
        });
    }

    let label_end = header_end
        .checked_add(label_len)
        .ok_or(WireError::Oversize(label_len))?;
    let value_end = label_end
        .checked_add(value_len)
        .ok_or(WireError::Oversize(value_len))?;
    if bytes.len() < value_end {
        return Err(WireError::Truncated {
            needed: value_end,
            actual: bytes.len(),
        });
    }

    let label = decode_label(&bytes[header_end..label_end])?;
    let value = Value::decode_payload(data_type, &bytes[label_end..value_end])?;

    Ok((Param { label, value }, value_end))
}

fn decode_label(raw: &[u8]) -> Result<Label, WireError> {
    let Some((&0, text)) = raw.split_last() else {
        return Err(WireError::InvalidLabel);
    };
    let text = std::str::from_utf8(text).map_err(|_| WireError::InvalidLabel)?;
    Label::new(text).map_err(|_| WireError::InvalidLabel)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn label(text: &str) -> Label {
        Label::new(text).expect("valid label")
    }

    fn sample(msg_type: MessageType, params: Vec<Param>) -> Message {
        Message::new(msg_type, 42, params)
    }

    #[rstest]
    #[case::string(Value::String("hostname".into()))]
    #[case::empty_string(Value::String(String::new()))]
    #[case::int32(Value::Int32(-1500))]
    #[case::uint32(Value::Uint32(1500))]
    #[case::int64(Value::Int64(i64::MIN))]
    #[case::uint64(Value::Uint64(u64::MAX))]
    #[case::float(Value::Float(0.5))]
    #[case::double(Value::Double(2.5))]
    #[case::boolean(Value::Boolean(true))]
    fn encode_decode_is_identity_per_type(#[case] value: Value) {
        let message = sample(
            MessageType::Set,
            vec![
                Param::plain(Value::String("base".into())),
                Param::plain(Value::String("net".into())),
                Param::plain(Value::String("mtu".into())),
                Param::new(label("System"), value),
            ],
        );
        let bytes = encode(&message).expect("encode");
        let decoded = decode(&bytes, Direction::Request).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn encode_decode_is_identity_at_the_parameter_cap() {
        let params = (0..MAX_PARAMS)
            .map(|i| Param::plain(Value::Uint32(i as u32)))
            .collect();
        let message = sample(MessageType::Status, params);
        let bytes = encode(&message).expect("encode");
        assert_eq!(decode(&bytes, Direction::Response).expect("decode"), message);
    }

    #[test]
    fn peek_size_waits_for_header_bytes() {
        let bytes = encode(&sample(MessageType::List, vec![Param::plain(Value::String("base".into()))]))
            .expect("encode");
        assert_eq!(peek_size(&bytes[..7]).expect("peek"), None);
        assert_eq!(peek_size(&bytes[..8]).expect("peek"), Some(bytes.len()));
    }

    #[test]
    fn peek_size_rejects_bad_magic() {
        let mut bytes =
            encode(&sample(MessageType::List, vec![Param::plain(Value::String("base".into()))]))
                .expect("encode");
        bytes[0] ^= 0xff;
        assert!(matches!(
            peek_size(&bytes),
            Err(WireError::BadMagic { .. })
        ));
    }

    #[test]
    fn peek_size_rejects_oversize_declarations() {
        let mut bytes =
            encode(&sample(MessageType::List, vec![Param::plain(Value::String("base".into()))]))
                .expect("encode");
        bytes[4..8].copy_from_slice(&4097_u32.to_le_bytes());
        assert!(matches!(peek_size(&bytes), Err(WireError::Oversize(4097))));
    }

    #[test]
    fn encode_rejects_oversize_frames() {
        let big = "x".repeat(MAX_MESSAGE_LEN);
        let message = sample(MessageType::Set, vec![Param::plain(Value::String(big))]);
        assert!(matches!(encode(&message), Err(WireError::Oversize(_))));
    }

    #[test]
    fn encode_rejects_too_many_params() {
        let params = (0..=MAX_PARAMS)
            .map(|i| Param::plain(Value::Uint32(i as u32)))
            .collect();
        let message = sample(MessageType::Status, params);
        assert!(matches!(
            encode(&message),
            Err(WireError::TooManyParams(17))
        ));
    }

    #[rstest]
    #[case::magic(0, 0xff)]
    #[case::message_type(8, 0x7f)]
    fn decode_rejects_corrupted_header_bytes(#[case] offset: usize, #[case] flip: u8) {
        let mut bytes =
            encode(&sample(MessageType::Get, vec![
                Param::plain(Value::String("net".into())),
                Param::plain(Value::String("mtu".into())),
            ]))
            .expect("encode");
        bytes[offset] ^= flip;
        assert!(decode(&bytes, Direction::Request).is_err());
    }

    #[test]
    fn decode_rejects_declared_length_disagreement() {
        let mut bytes =
            encode(&sample(MessageType::List, vec![Param::plain(Value::String("base".into()))]))
                .expect("encode");
        let wrong = (bytes.len() - 1) as u32;
        bytes[4..8].copy_from_slice(&wrong.to_le_bytes());
        assert!(matches!(
            decode(&bytes, Direction::Request),
            Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_overflowing_param_lengths() {
        let mut bytes =
            encode(&sample(MessageType::List, vec![Param::plain(Value::String("base".into()))]))
                .expect("encode");
        // Corrupt the label length of the first parameter.
        bytes[HEADER_LEN + 4..HEADER_LEN + 8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(decode(&bytes, Direction::Request).is_err());
    }

    #[test]
    fn decode_rejects_direction_violations() {
        let request =
            encode(&sample(MessageType::Get, vec![
                Param::plain(Value::String("net".into())),
                Param::plain(Value::String("mtu".into())),
            ]))
            .expect("encode");
        assert!(matches!(
            decode(&request, Direction::Response),
            Err(WireError::ForbiddenMessageType { .. })
        ));

        let response = encode(&sample(MessageType::Status, vec![Param::plain(Value::Int32(0))]))
            .expect("encode");
        assert!(matches!(
            decode(&response, Direction::Request),
            Err(WireError::ForbiddenMessageType { .. })
        ));
    }

    #[test]
    fn decode_rejects_short_labels() {
        let mut bytes =
            encode(&sample(MessageType::List, vec![Param::plain(Value::String("base".into()))]))
                .expect("encode");
        bytes[HEADER_LEN + 4..HEADER_LEN + 8].copy_from_slice(&1_u32.to_le_bytes());
        assert!(matches!(
            decode(&bytes, Direction::Request),
            Err(WireError::InvalidLabel) | Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn minimum_parameter_size_matches_the_layout() {
        let message = sample(
            MessageType::Status,
            vec![Param::new(label("_"), Value::Boolean(false))],
        );
        let bytes = encode(&message).expect("encode");
        assert_eq!(bytes.len(), HEADER_LEN + MIN_PARAM_LEN);
    }
}
