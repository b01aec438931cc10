//! Wire types: the outer JSON-RPC envelope and the decrypted inner message.
//!
//! Every frame on the relay is one JSON object:
//!
//!   {"jsonrpc":"2.0","id":"<16-byte hex>","method":"...","params":{...},"origin"?:"..."}
//!
//! `origin` is attached by the relay, never by the sender. The inner
//! message lives inside the AEAD plaintext of `encryptedMessage` payloads
//! and optionally carries chunking metadata:
//!
//!   {"method":"...","params":<object|string|null>,"chunk"?:{"id","index","length"}}

use crate::core::error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version tag on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

// ── Methods ──────────────────────────────────────────────────────────────────

pub const METHOD_ENCRYPTED_MESSAGE: &str = "encryptedMessage";
pub const METHOD_HANDSHAKE: &str = "handshake";
pub const METHOD_HELLO: &str = "hello";
pub const METHOD_PING: &str = "ping";
pub const METHOD_PONG: &str = "pong";
pub const METHOD_REPLAY: &str = "replay";
pub const METHOD_ERROR: &str = "error";

// ── Outer envelope ───────────────────────────────────────────────────────────

/// Outer JSON-RPC frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Set by the relay from the sender's declared origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Marks control replies the relay must not buffer for replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nocache: Option<bool>,
}

impl Envelope {
    /// New envelope with a fresh random id.
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(random_id()),
            method: method.to_string(),
            params,
            origin: None,
            nocache: None,
        }
    }

    /// An `encryptedMessage` envelope around a base64 AEAD payload.
    pub fn encrypted(payload_b64: String) -> Self {
        Self::new(
            METHOD_ENCRYPTED_MESSAGE,
            serde_json::json!({ "payload": payload_b64 }),
        )
    }

    /// A wire-level `error` envelope.
    pub fn error(message: &str) -> Self {
        Self::new(METHOD_ERROR, serde_json::json!({ "message": message }))
    }

    /// A `pong` reply; `nocache` keeps it out of the relay's replay buffer.
    pub fn pong() -> Self {
        let mut envelope = Self::new(METHOD_PONG, serde_json::json!({}));
        envelope.nocache = Some(true);
        envelope
    }

    /// Parse a raw text frame. Fail-closed: anything that is not a JSON
    /// object with the expected fields is an error.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        Ok(envelope)
    }

    /// Serialize to the text frame that goes on the wire.
    pub fn to_frame(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The base64 AEAD payload of an `encryptedMessage`, if present.
    pub fn payload(&self) -> Option<&str> {
        self.params.get("payload").and_then(Value::as_str)
    }

    /// The non-empty id of this frame, if it carries one.
    pub fn message_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Fresh wire id: 16 random bytes, lowercase hex.
pub fn random_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

// ── Inner message ────────────────────────────────────────────────────────────

/// Chunking metadata inside the AEAD plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Chunk-group id shared by all parts of one message.
    pub id: String,
    /// Zero-based position within the group.
    pub index: u32,
    /// Total number of parts in the group.
    pub length: u32,
}

/// The decrypted application message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerMessage {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
}

impl InnerMessage {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            method: method.to_string(),
            params,
            chunk: None,
        }
    }

    pub fn parse(plaintext: &[u8]) -> Result<Self, BridgeError> {
        let inner: InnerMessage = serde_json::from_slice(plaintext)?;
        Ok(inner)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BridgeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// True when this message is one complete part (no chunk tag, or a
    /// group of length 1).
    pub fn is_single_part(&self) -> bool {
        match &self.chunk {
            None => true,
            Some(chunk) => chunk.length <= 1,
        }
    }
}

// ── Origin reduction ─────────────────────────────────────────────────────────

/// Reduce an origin to `scheme://host`, stripping port and path.
///
/// Tokens that do not parse as absolute URLs (the literal `nodejs`) pass
/// through unchanged and compare as opaque strings.
pub fn reduce_origin(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => format!("{}://{}", parsed.scheme(), host),
            None => raw.to_string(),
        },
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::new(METHOD_PING, serde_json::json!({}));
        let frame = envelope.to_frame().unwrap();
        assert!(frame.contains(r#""jsonrpc":"2.0""#));
        assert!(frame.contains(r#""method":"ping""#));
        assert!(!frame.contains("origin"), "sender never sets origin");
        assert!(!frame.contains("nocache"));

        let parsed = Envelope::parse(&frame).unwrap();
        assert_eq!(parsed.method, METHOD_PING);
        assert_eq!(parsed.id, envelope.id);
    }

    #[test]
    fn test_random_id_shape() {
        let id = random_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_id(), random_id());
    }

    #[test]
    fn test_pong_carries_nocache() {
        let frame = Envelope::pong().to_frame().unwrap();
        assert!(frame.contains(r#""nocache":true"#));
    }

    #[test]
    fn test_message_id_rejects_empty() {
        let mut envelope = Envelope::new(METHOD_PING, serde_json::json!({}));
        envelope.id = Some(String::new());
        assert!(envelope.message_id().is_none());
        envelope.id = None;
        assert!(envelope.message_id().is_none());
    }

    #[test]
    fn test_payload_accessor() {
        let envelope = Envelope::encrypted("YWJj".into());
        assert_eq!(envelope.payload(), Some("YWJj"));
        assert!(Envelope::new(METHOD_PING, serde_json::json!({})).payload().is_none());
    }

    #[test]
    fn test_inner_single_part_detection() {
        let mut inner = InnerMessage::new("m", Value::Null);
        assert!(inner.is_single_part());

        inner.chunk = Some(ChunkInfo {
            id: "g".into(),
            index: 0,
            length: 1,
        });
        assert!(inner.is_single_part());

        inner.chunk.as_mut().unwrap().length = 3;
        assert!(!inner.is_single_part());
    }

    #[test]
    fn test_inner_roundtrip_with_chunk() {
        let inner = InnerMessage {
            method: "data".into(),
            params: Value::String("abcd".into()),
            chunk: Some(ChunkInfo {
                id: "beef".into(),
                index: 2,
                length: 5,
            }),
        };
        let bytes = inner.to_bytes().unwrap();
        let parsed = InnerMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.method, "data");
        assert_eq!(parsed.params, Value::String("abcd".into()));
        let chunk = parsed.chunk.unwrap();
        assert_eq!((chunk.index, chunk.length), (2, 5));
    }

    #[test]
    fn test_reduce_origin_strips_port_and_path() {
        assert_eq!(
            reduce_origin("https://example.com:8443/app?x=1"),
            "https://example.com"
        );
        assert_eq!(reduce_origin("https://example.com"), "https://example.com");
        assert_eq!(reduce_origin("http://localhost:3000"), "http://localhost");
    }

    #[test]
    fn test_reduce_origin_passes_tokens_through() {
        assert_eq!(reduce_origin("nodejs"), "nodejs");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse("[1,2,3]").is_err());
    }
}
