//! Outbound pipeline: compress, chunk, encrypt, envelope.
//!
//! Stages for one `send_secure(method, params)` call:
//! 1. Serialize and deflate-compress the params
//! 2. Base64 the compressed blob and split it into 16 KB parts
//! 3. Seal each part with AES-256-GCM under the session secret
//! 4. Wrap each sealed part in an `encryptedMessage` outer envelope
//!
//! Empty params skip stages 1–2 and go out as a single unchunked inner
//! message. An outer envelope whose serialized JSON exceeds the payload
//! cap is a send-time error.

use crate::core::config::{CHUNK_SIZE, MAX_PAYLOAD_SIZE};
use crate::core::error::BridgeError;
use crate::core::protocol::envelope::{
    random_id, ChunkInfo, Envelope, InnerMessage, METHOD_HELLO,
};
use crate::core::security::crypto::{self, SHARED_SECRET_SIZE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::Write;
use tracing::debug;

/// Encode one secure message as the ordered list of outer envelopes to
/// put on the wire.
pub fn encode_secure(
    method: &str,
    params: &Value,
    shared_secret: &[u8; SHARED_SECRET_SIZE],
    bridge_id: &str,
) -> Result<Vec<Envelope>, BridgeError> {
    if is_empty_params(params) {
        let inner = InnerMessage::new(method, serde_json::json!({}));
        return Ok(vec![seal(&inner, shared_secret, bridge_id)?]);
    }

    let json = serde_json::to_vec(params)?;
    let blob = BASE64.encode(deflate(&json)?);

    let total = blob.len().div_ceil(CHUNK_SIZE) as u32;
    let group_id = random_id();
    debug!(method, parts = total, blob_bytes = blob.len(), "Encoding secure message");

    let mut envelopes = Vec::with_capacity(total as usize);
    for index in 0..total {
        let start = index as usize * CHUNK_SIZE;
        let end = usize::min(start + CHUNK_SIZE, blob.len());
        // The blob is base64 text, so byte-range slicing is char-safe.
        let part = &blob[start..end];

        let inner = InnerMessage {
            method: method.to_string(),
            params: Value::String(part.to_string()),
            chunk: Some(ChunkInfo {
                id: group_id.clone(),
                index,
                length: total,
            }),
        };
        envelopes.push(seal(&inner, shared_secret, bridge_id)?);
    }
    Ok(envelopes)
}

/// Encode the Creator's encrypted `hello` handshake reply.
pub fn encode_hello(
    shared_secret: &[u8; SHARED_SECRET_SIZE],
    bridge_id: &str,
) -> Result<Envelope, BridgeError> {
    let inner = InnerMessage::new(METHOD_HELLO, Value::Null);
    seal(&inner, shared_secret, bridge_id)
}

/// Encrypt an inner message and wrap it in its outer envelope, enforcing
/// the envelope size cap.
fn seal(
    inner: &InnerMessage,
    shared_secret: &[u8; SHARED_SECRET_SIZE],
    bridge_id: &str,
) -> Result<Envelope, BridgeError> {
    let plaintext = inner.to_bytes()?;
    let ciphertext = crypto::encrypt(&plaintext, shared_secret, bridge_id)?;
    let envelope = Envelope::encrypted(BASE64.encode(ciphertext));

    let frame_len = envelope.to_frame()?.len();
    if frame_len > MAX_PAYLOAD_SIZE {
        return Err(BridgeError::protocol(format!(
            "envelope of {frame_len} bytes exceeds the {MAX_PAYLOAD_SIZE}-byte payload cap"
        )));
    }
    Ok(envelope)
}

/// Deflate (zlib container) — the format the decoder inflates.
fn deflate(data: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| BridgeError::crypto(format!("deflate failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| BridgeError::crypto(format!("deflate failed: {e}")))
}

fn is_empty_params(params: &Value) -> bool {
    match params {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::crypto::{decrypt, KeyPair};

    fn session_secret() -> ([u8; 32], String) {
        let creator = KeyPair::generate();
        let joiner = KeyPair::generate();
        let secret = joiner.derive_shared_secret(&creator.public_key()).unwrap();
        (secret, creator.public_key_hex())
    }

    fn open_inner(envelope: &Envelope, secret: &[u8; 32], bridge_id: &str) -> InnerMessage {
        let ciphertext = BASE64.decode(envelope.payload().unwrap()).unwrap();
        let plaintext = decrypt(&ciphertext, secret, bridge_id).unwrap();
        InnerMessage::parse(&plaintext).unwrap()
    }

    #[test]
    fn test_empty_params_single_unchunked_envelope() {
        let (secret, bridge_id) = session_secret();
        let envelopes =
            encode_secure("greet", &Value::Null, &secret, &bridge_id).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].method, "encryptedMessage");

        let inner = open_inner(&envelopes[0], &secret, &bridge_id);
        assert_eq!(inner.method, "greet");
        assert_eq!(inner.params, serde_json::json!({}));
        assert!(inner.chunk.is_none());
    }

    #[test]
    fn test_small_params_single_chunk_group() {
        let (secret, bridge_id) = session_secret();
        let params = serde_json::json!({ "text": "hi" });
        let envelopes = encode_secure("msg", &params, &secret, &bridge_id).unwrap();
        assert_eq!(envelopes.len(), 1);

        let inner = open_inner(&envelopes[0], &secret, &bridge_id);
        let chunk = inner.chunk.expect("non-empty params are chunk-tagged");
        assert_eq!((chunk.index, chunk.length), (0, 1));
        assert!(inner.params.is_string());
    }

    #[test]
    fn test_large_params_split_into_ordered_chunks() {
        let (secret, bridge_id) = session_secret();
        // Incompressible payload, so the blob genuinely spans many chunks.
        let noise: Vec<u8> = (0..256 * 1024).map(|_| rand::random::<u8>()).collect();
        let params = serde_json::json!({ "payload": hex::encode(noise) });

        let envelopes = encode_secure("big", &params, &secret, &bridge_id).unwrap();
        assert!(envelopes.len() > 1, "256 KiB must not fit one chunk");

        let mut group_ids = std::collections::HashSet::new();
        let mut envelope_ids = std::collections::HashSet::new();
        for (i, envelope) in envelopes.iter().enumerate() {
            assert!(envelope.to_frame().unwrap().len() <= MAX_PAYLOAD_SIZE);
            envelope_ids.insert(envelope.id.clone().unwrap());

            let inner = open_inner(envelope, &secret, &bridge_id);
            let chunk = inner.chunk.unwrap();
            assert_eq!(chunk.index as usize, i, "chunks emitted in index order");
            assert_eq!(chunk.length as usize, envelopes.len());
            group_ids.insert(chunk.id);
        }
        assert_eq!(group_ids.len(), 1, "one group id per message");
        assert_eq!(envelope_ids.len(), envelopes.len(), "fresh outer id per chunk");
    }

    #[test]
    fn test_hello_reply_is_unchunked_null_params() {
        let (secret, bridge_id) = session_secret();
        let envelope = encode_hello(&secret, &bridge_id).unwrap();
        let inner = open_inner(&envelope, &secret, &bridge_id);
        assert_eq!(inner.method, "hello");
        assert!(inner.params.is_null());
        assert!(inner.chunk.is_none());
    }
}
