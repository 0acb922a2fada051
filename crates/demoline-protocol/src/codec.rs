//! Codec trait and implementations for serializing/deserializing control
//! messages.
//!
//! The protocol layer doesn't care HOW messages are serialized; it needs
//! something that implements [`Codec`]. [`JsonCodec`] is the only
//! implementation today.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;

    /// Serializes a value for a text frame.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidMessage` if the codec's output is
    /// not valid UTF-8.
    fn encode_text<T: Serialize>(&self, value: &T) -> Result<String, ProtocolError> {
        let bytes = self.encode(value)?;
        String::from_utf8(bytes)
            .map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }
}

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ## Example
///
/// ```rust
/// use demoline_protocol::{Codec, JsonCodec, Request, SessionId};
///
/// let codec = JsonCodec;
/// let request = Request::Attach {
///     api_key: "key".into(),
///     session_id: SessionId::new("abc"),
/// };
///
/// let bytes = codec.encode(&request).unwrap();
/// let decoded: Request = codec.decode(&bytes).unwrap();
/// assert_eq!(request, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{Reply, Request};

    #[test]
    fn test_decode_unknown_type_returns_decode_error() {
        let result: Result<Request, _> = JsonCodec.decode(br#"{"type":"Nope"}"#);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_truncated_returns_decode_error() {
        let result: Result<Request, _> = JsonCodec.decode(br#"{"type":"Fin"#);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_encode_text_produces_json_string() {
        let text = JsonCodec
            .encode_text(&Reply::Error {
                code: 401,
                message: "unknown api key".into(),
            })
            .expect("should encode");
        assert!(text.starts_with('{'));
        assert!(text.contains(r#""type":"Error""#));
        assert!(text.contains(r#""code":401"#));
    }
}
