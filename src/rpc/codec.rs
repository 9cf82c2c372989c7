//! MessagePack-RPC wire codec.
//!
//! Every client/server exchange is a concatenation of MessagePack-RPC
//! messages. There is no outer length prefix; a message is exactly one
//! top-level MessagePack array:
//!
//! ```text
//! [0, msgid: u32, method: str, params: array]   request
//! [1, msgid: u32, error: Value, result: Value]  response
//! [2, method: str, params: array]               notification
//! ```
//!
//! [`decode_one`] consumes exactly one complete value and reports the
//! consumed byte count so trailing bytes stay buffered. A truncated value
//! is not an error — it means "need more data" and the caller re-arms a
//! read. [`MessageDecoder`] wraps that into an incremental decoder in the
//! style of a TCP reassembly buffer.

use std::io::Cursor;

use rmpv::Value;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Cap on bytes buffered without containing one complete message (64 MB).
///
/// MessagePack has no length prefix, so the cap is enforced on the
/// reassembly buffer instead: a peer that streams this much without ever
/// completing a message is violating the protocol.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Wire type tags per the MessagePack-RPC dialect.
mod msg_type {
    pub const REQUEST: u64 = 0;
    pub const RESPONSE: u64 = 1;
    pub const NOTIFICATION: u64 = 2;
}

/// Errors produced while decoding inbound messages.
///
/// Any of these closes the offending client; other clients are unaffected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Structurally valid MessagePack that is not a valid RPC message.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// An integer field (message id, type tag) outside its wire range.
    #[error("integer field out of range")]
    IntegerOverflow,

    /// A string field that is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Malformed MessagePack that can never complete into a value.
    #[error("malformed MessagePack: {0}")]
    Decode(rmpv::decode::Error),

    /// Reassembly buffer exceeded [`MAX_MESSAGE_SIZE`] without a message.
    #[error("message too large: {0} bytes buffered (max {MAX_MESSAGE_SIZE})")]
    Oversized(usize),
}

/// A decoded MessagePack-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Expects exactly one `Response` with the same id.
    Request {
        id: u32,
        method: String,
        params: Vec<Value>,
    },
    /// Exactly one of `error` / `result` is non-nil.
    Response {
        id: u32,
        error: Value,
        result: Value,
    },
    /// Fire-and-forget; no reply is ever produced.
    Notification { method: String, params: Vec<Value> },
}

impl Message {
    pub fn request(id: u32, method: &str, params: Vec<Value>) -> Self {
        Message::Request {
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn response_ok(id: u32, result: Value) -> Self {
        Message::Response {
            id,
            error: Value::Nil,
            result,
        }
    }

    pub fn response_err(id: u32, error: impl Into<String>) -> Self {
        Message::Response {
            id,
            error: Value::from(error.into()),
            result: Value::Nil,
        }
    }

    pub fn notification(method: &str, params: Vec<Value>) -> Self {
        Message::Notification {
            method: method.to_string(),
            params,
        }
    }

    /// Encode this message into wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            Message::Request { id, method, params } => Value::Array(vec![
                Value::from(msg_type::REQUEST),
                Value::from(*id),
                Value::from(method.as_str()),
                Value::Array(params.clone()),
            ]),
            Message::Response { id, error, result } => Value::Array(vec![
                Value::from(msg_type::RESPONSE),
                Value::from(*id),
                error.clone(),
                result.clone(),
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(msg_type::NOTIFICATION),
                Value::from(method.as_str()),
                Value::Array(params.clone()),
            ]),
        };
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value)
            .expect("MessagePack encode to Vec cannot fail");
        buf
    }

    /// Interpret a decoded top-level value as an RPC message.
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Array(items) = value else {
            return Err(ProtocolError::InvalidFormat(
                "message is not an array".into(),
            ));
        };

        let tag = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::InvalidFormat("missing type tag".into()))?;

        match tag {
            msg_type::REQUEST => {
                let [_, id, method, params] = take_arity::<4>(items, "request")?;
                Ok(Message::Request {
                    id: message_id(&id)?,
                    method: method_name(&method)?,
                    params: params_array(params)?,
                })
            }
            msg_type::RESPONSE => {
                let [_, id, error, result] = take_arity::<4>(items, "response")?;
                Ok(Message::Response {
                    id: message_id(&id)?,
                    error,
                    result,
                })
            }
            msg_type::NOTIFICATION => {
                let [_, method, params] = take_arity::<3>(items, "notification")?;
                Ok(Message::Notification {
                    method: method_name(&method)?,
                    params: params_array(params)?,
                })
            }
            other => Err(ProtocolError::InvalidFormat(format!(
                "unknown message type tag: {other}"
            ))),
        }
    }
}

fn take_arity<const N: usize>(
    items: Vec<Value>,
    kind: &str,
) -> Result<[Value; N], ProtocolError> {
    let len = items.len();
    items.try_into().map_err(|_| {
        ProtocolError::InvalidFormat(format!("{kind} has {len} elements, expected {}", N))
    })
}

fn message_id(value: &Value) -> Result<u32, ProtocolError> {
    let id = value
        .as_u64()
        .ok_or_else(|| ProtocolError::InvalidFormat("message id is not an integer".into()))?;
    u32::try_from(id).map_err(|_| ProtocolError::IntegerOverflow)
}

fn method_name(value: &Value) -> Result<String, ProtocolError> {
    match value {
        Value::String(s) => s
            .as_str()
            .map(str::to_string)
            .ok_or(ProtocolError::InvalidUtf8),
        _ => Err(ProtocolError::InvalidFormat(
            "method name is not a string".into(),
        )),
    }
}

fn params_array(value: Value) -> Result<Vec<Value>, ProtocolError> {
    match value {
        Value::Array(params) => Ok(params),
        _ => Err(ProtocolError::InvalidFormat("params is not an array".into())),
    }
}

/// Whether a decode error means the buffer ended mid-value.
fn is_truncation(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match err {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Decode exactly one message from the front of `buf`.
///
/// Returns the message and the number of bytes it consumed, `Ok(None)` if
/// the buffer holds only a prefix of a message ("need more data").
///
/// # Errors
///
/// Returns a [`ProtocolError`] for malformed MessagePack or a value that
/// is not a valid RPC message.
pub fn decode_one(buf: &[u8]) -> Result<Option<(Message, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(buf);
    let value = match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => value,
        Err(e) if is_truncation(&e) => return Ok(None),
        Err(e) => return Err(ProtocolError::Decode(e)),
    };
    let consumed = cursor.position() as usize;
    Ok(Some((Message::from_value(value)?, consumed)))
}

/// Incremental message decoder over a raw byte stream.
///
/// Feed socket reads via [`MessageDecoder::feed`] and extract complete
/// messages; partial tails stay buffered for the next call.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
}

impl MessageDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain every complete message.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is malformed or the buffered tail
    /// exceeds [`MAX_MESSAGE_SIZE`]; the connection should be closed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        self.buf.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let mut offset = 0;
        while let Some((message, consumed)) = decode_one(&self.buf[offset..])? {
            messages.push(message);
            offset += consumed;
        }
        self.buf.drain(..offset);

        if self.buf.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::Oversized(self.buf.len()));
        }
        Ok(messages)
    }

    /// Returns true if a partial message is buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

// ── Typed param access ────────────────────────────────────────────────────────

/// Positional u64 param (accepts any non-negative integer encoding).
pub fn param_u64(params: &[Value], idx: usize) -> Result<u64, ProtocolError> {
    params
        .get(idx)
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::InvalidFormat(format!("param {idx}: expected integer")))
}

/// Positional string param.
pub fn param_str<'a>(params: &'a [Value], idx: usize) -> Result<&'a str, ProtocolError> {
    match params.get(idx) {
        Some(Value::String(s)) => s.as_str().ok_or(ProtocolError::InvalidUtf8),
        _ => Err(ProtocolError::InvalidFormat(format!(
            "param {idx}: expected string"
        ))),
    }
}

/// Positional byte-string param; accepts bin or str encodings.
pub fn param_bytes(params: &[Value], idx: usize) -> Result<Vec<u8>, ProtocolError> {
    match params.get(idx) {
        Some(Value::Binary(b)) => Ok(b.clone()),
        Some(Value::String(s)) => Ok(s.as_bytes().to_vec()),
        _ => Err(ProtocolError::InvalidFormat(format!(
            "param {idx}: expected bytes"
        ))),
    }
}

/// Decode a positional param into a serde container.
///
/// Accepts either a map (field-by-name, unknown keys skipped) or an array
/// (field-by-position). Missing required fields are an `InvalidFormat`.
pub fn param_decode<T: DeserializeOwned>(
    params: &[Value],
    idx: usize,
) -> Result<T, ProtocolError> {
    let value = params
        .get(idx)
        .cloned()
        .ok_or_else(|| ProtocolError::InvalidFormat(format!("param {idx}: missing")))?;
    rmpv::ext::from_value(value)
        .map_err(|e| ProtocolError::InvalidFormat(format!("param {idx}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn encode_value(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    #[test]
    fn test_request_round_trip() {
        let msg = Message::request(7, "spawn", vec![Value::from("x")]);
        let bytes = msg.encode();
        let (decoded, consumed) = decode_one(&bytes).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_response_round_trip() {
        let msg = Message::response_ok(42, Value::from(3u64));
        let (decoded, _) = decode_one(&msg.encode()).unwrap().unwrap();
        assert_eq!(decoded, msg);

        let msg = Message::response_err(43, "boom");
        let (decoded, _) = decode_one(&msg.encode()).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_notification_round_trip() {
        let msg = Message::notification("bell", vec![Value::from(1u64)]);
        let (decoded, _) = decode_one(&msg.encode()).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_value_round_trip_mixed() {
        let value = Value::Array(vec![
            Value::Nil,
            Value::from(true),
            Value::from(-42i64),
            Value::from(42u64),
            Value::from(1.5f64),
            Value::from("text"),
            Value::Binary(vec![0, 255, 128]),
            Value::Map(vec![(Value::from("k"), Value::from(1u64))]),
        ]);
        let bytes = encode_value(&value);
        let decoded = rmpv::decode::read_value(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_signed_unsigned_normalization() {
        // A non-negative i64 encodes in the uint family and still compares
        // equal after the round trip.
        let value = Value::from(5i64);
        let bytes = encode_value(&value);
        assert_eq!(bytes, vec![0x05]);
        let decoded = rmpv::decode::read_value(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(decoded, Value::from(5u64));
    }

    #[test]
    fn test_shortest_prefix_integers() {
        let cases: Vec<(i128, Vec<u8>)> = vec![
            (0, vec![0x00]),
            (127, vec![0x7f]),
            (128, vec![0xcc, 0x80]),
            (255, vec![0xcc, 0xff]),
            (256, vec![0xcd, 0x01, 0x00]),
            (65535, vec![0xcd, 0xff, 0xff]),
            (65536, vec![0xce, 0x00, 0x01, 0x00, 0x00]),
            (u32::MAX as i128, vec![0xce, 0xff, 0xff, 0xff, 0xff]),
            (
                1 << 32,
                vec![0xcf, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
            ),
            (-1, vec![0xff]),
            (-32, vec![0xe0]),
            (-33, vec![0xd0, 0xdf]),
            (-128, vec![0xd0, 0x80]),
            (-129, vec![0xd1, 0xff, 0x7f]),
            (-32768, vec![0xd1, 0x80, 0x00]),
            (-32769, vec![0xd2, 0xff, 0xff, 0x7f, 0xff]),
            (i32::MIN as i128, vec![0xd2, 0x80, 0x00, 0x00, 0x00]),
            (
                i32::MIN as i128 - 1,
                vec![0xd3, 0xff, 0xff, 0xff, 0xff, 0x7f, 0xff, 0xff, 0xff],
            ),
        ];
        for (n, expected) in cases {
            let value = if n >= 0 {
                Value::from(n as u64)
            } else {
                Value::from(n as i64)
            };
            assert_eq!(
                encode_value(&value),
                expected,
                "wrong encoding for {n}"
            );
        }
    }

    #[test]
    fn test_shortest_prefix_strings_and_floats() {
        assert_eq!(encode_value(&Value::from("a"))[0], 0xa1); // fixstr
        let long = "x".repeat(32);
        assert_eq!(encode_value(&Value::from(long.as_str()))[0], 0xd9); // str8
        assert_eq!(encode_value(&Value::from(1.0f64))[0], 0xcb); // float64 always
    }

    #[test]
    fn test_streaming_two_messages_no_tail() {
        let a = Message::request(1, "attach", vec![Value::from(9u64)]);
        let b = Message::notification("bell", vec![Value::from(9u64)]);

        let mut wire = a.encode();
        wire.extend_from_slice(&b.encode());

        let mut decoder = MessageDecoder::new();
        let messages = decoder.feed(&wire).unwrap();
        assert_eq!(messages, vec![a, b]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_partial_message_needs_more_data() {
        let msg = Message::request(1, "spawn", vec![Value::from("argv")]);
        let wire = msg.encode();

        let mut decoder = MessageDecoder::new();
        // Every strict prefix decodes to nothing and is never an error.
        for cut in 0..wire.len() {
            let mut d = MessageDecoder::new();
            assert!(d.feed(&wire[..cut]).unwrap().is_empty(), "cut at {cut}");
        }
        let mid = wire.len() / 2;
        assert!(decoder.feed(&wire[..mid]).unwrap().is_empty());
        assert!(decoder.has_partial());
        let messages = decoder.feed(&wire[mid..]).unwrap();
        assert_eq!(messages, vec![msg]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_invalid_type_tag_rejected() {
        let bad = Value::Array(vec![
            Value::from(7u64),
            Value::from(1u64),
            Value::from("x"),
            Value::Array(vec![]),
        ]);
        let err = decode_one(&encode_value(&bad)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFormat(_)));
    }

    #[test]
    fn test_wrong_arity_rejected() {
        let bad = Value::Array(vec![Value::from(0u64), Value::from(1u64)]);
        let err = decode_one(&encode_value(&bad)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFormat(_)));
    }

    #[test]
    fn test_message_id_overflow_rejected() {
        let bad = Value::Array(vec![
            Value::from(0u64),
            Value::from(u64::from(u32::MAX) + 1),
            Value::from("m"),
            Value::Array(vec![]),
        ]);
        let err = decode_one(&encode_value(&bad)).unwrap_err();
        assert!(matches!(err, ProtocolError::IntegerOverflow));
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Known {
        known: u32,
    }

    #[test]
    fn test_unknown_map_keys_skipped() {
        let map = Value::Map(vec![
            (Value::from("known"), Value::from(1u64)),
            (
                Value::from("_unknown"),
                Value::Array(vec![
                    Value::from(1u64),
                    Value::Map(vec![(Value::from("a"), Value::from(2u64))]),
                    Value::from("x"),
                ]),
            ),
        ]);
        let decoded: Known = param_decode(&[map], 0).unwrap();
        assert_eq!(decoded, Known { known: 1 });
    }

    #[test]
    fn test_struct_decodes_from_array() {
        let arr = Value::Array(vec![Value::from(1u64)]);
        let decoded: Known = param_decode(&[arr], 0).unwrap();
        assert_eq!(decoded, Known { known: 1 });
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let map = Value::Map(vec![(Value::from("other"), Value::from(1u64))]);
        assert!(param_decode::<Known>(&[map], 0).is_err());
    }

    #[test]
    fn test_param_bytes_accepts_bin_and_str() {
        let params = vec![Value::Binary(vec![1, 2]), Value::from("ab")];
        assert_eq!(param_bytes(&params, 0).unwrap(), vec![1, 2]);
        assert_eq!(param_bytes(&params, 1).unwrap(), b"ab".to_vec());
    }
}
