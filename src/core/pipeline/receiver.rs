//! Inbound pipeline: decrypt, reassemble, decompress, decode.
//!
//! Stages for one accepted `encryptedMessage` payload:
//! 1. Base64-decode and open the AEAD payload
//! 2. Parse the inner message
//! 3. Single parts: decode the params blob (compressed, or the legacy
//!    uncompressed form)
//! 4. Chunked parts: feed the accumulator; on the final part, decode the
//!    concatenated blob
//!
//! The legacy path is keyed on a distinct error kind: only an input whose
//! first two bytes fail the zlib header check counts as "not compressed".
//! A truncated or corrupt zlib stream is fatal.

use crate::core::error::BridgeError;
use crate::core::pipeline::chunk::{ChunkAccumulator, ChunkOutcome};
use crate::core::protocol::envelope::{InnerMessage, METHOD_HELLO};
use crate::core::security::crypto::{self, SHARED_SECRET_SIZE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use serde_json::Value;
use std::io::Read;
use tracing::{debug, trace};

// ── Decoder output ───────────────────────────────────────────────────────────

/// What one decrypted payload produced.
#[derive(Debug)]
pub enum Inbound {
    /// The peer's `hello`: completes secure-channel establishment.
    Hello,
    /// A complete application message.
    Message { method: String, params: Value },
    /// One chunk accepted; the group is still incomplete.
    Chunk {
        group_id: String,
        received: u32,
        expected: u32,
    },
}

/// Decrypt and decode one `encryptedMessage` payload.
///
/// `established` gates the `hello` fast path: once the channel is up, a
/// stray `hello` is treated as an ordinary message.
pub fn decode_secure(
    payload_b64: &str,
    shared_secret: &[u8; SHARED_SECRET_SIZE],
    bridge_id: &str,
    established: bool,
    accumulator: &mut ChunkAccumulator,
) -> Result<Inbound, BridgeError> {
    let ciphertext = BASE64
        .decode(payload_b64)
        .map_err(|e| BridgeError::protocol(format!("payload is not valid base64: {e}")))?;
    let plaintext = crypto::decrypt(&ciphertext, shared_secret, bridge_id)?;
    let inner = InnerMessage::parse(&plaintext)?;
    trace!(method = %inner.method, chunked = !inner.is_single_part(), "Decrypted inner message");

    if inner.is_single_part() {
        if inner.method == METHOD_HELLO && !established {
            return Ok(Inbound::Hello);
        }
        let params = decode_single_params(inner.params)?;
        return Ok(Inbound::Message {
            method: inner.method,
            params,
        });
    }

    let Some(chunk) = inner.chunk else {
        return Err(BridgeError::protocol("multi-part message without chunk info"));
    };
    let part = match inner.params {
        Value::String(s) => s,
        other => {
            return Err(BridgeError::protocol(format!(
                "chunked message params must be a string, got {}",
                kind_of(&other)
            )))
        }
    };

    match accumulator.accept(&chunk.id, chunk.index, chunk.length, part)? {
        ChunkOutcome::Complete(blob) => {
            debug!(group_id = %chunk.id, parts = chunk.length, "Reassembled chunked message");
            Ok(Inbound::Message {
                method: inner.method,
                params: decode_blob(&blob)?,
            })
        }
        ChunkOutcome::Partial { received, expected } => Ok(Inbound::Chunk {
            group_id: chunk.id,
            received,
            expected,
        }),
    }
}

// ── Params decoding ──────────────────────────────────────────────────────────

/// Decode single-part params: non-empty strings are base64 + deflate
/// compressed blobs, with a legacy fallback for peers that sent the
/// params uncompressed. Everything else passes through untouched.
fn decode_single_params(params: Value) -> Result<Value, BridgeError> {
    let text = match &params {
        Value::String(s) if !s.is_empty() => s,
        _ => return Ok(params),
    };

    let compressed = match BASE64.decode(text) {
        Ok(bytes) => bytes,
        // Not base64 at all: legacy uncompressed form.
        Err(_) => return Ok(legacy_params(&params)),
    };

    match inflate(&compressed) {
        Ok(raw) => {
            let decoded: Value = serde_json::from_slice(&raw)
                .map_err(|e| BridgeError::protocol(format!("decompressed params are not JSON: {e}")))?;
            Ok(decoded)
        }
        Err(InflateError::NotZlib) => Ok(legacy_params(&params)),
        Err(InflateError::Corrupt(detail)) => Err(BridgeError::crypto(format!(
            "inflate failed on single-part params: {detail}"
        ))),
    }
}

/// Legacy uncompressed single-part params: JSON if they parse, otherwise
/// the raw string.
fn legacy_params(params: &Value) -> Value {
    let Value::String(text) = params else {
        return params.clone();
    };
    serde_json::from_str(text).unwrap_or_else(|_| params.clone())
}

/// Decode a reassembled chunk blob. No legacy form here: the chunked
/// encoding has always been base64 + deflate, so every failure is fatal.
fn decode_blob(blob: &str) -> Result<Value, BridgeError> {
    let compressed = BASE64
        .decode(blob)
        .map_err(|e| BridgeError::protocol(format!("chunk blob is not valid base64: {e}")))?;
    let raw = inflate(&compressed)
        .map_err(|e| BridgeError::crypto(format!("inflate failed on chunk blob: {e:?}")))?;
    serde_json::from_slice(&raw)
        .map_err(|e| BridgeError::protocol(format!("reassembled params are not JSON: {e}")))
}

// ── Inflate ──────────────────────────────────────────────────────────────────

/// Why an inflate attempt failed. `NotZlib` is the only kind that selects
/// the legacy uncompressed path.
#[derive(Debug)]
pub enum InflateError {
    /// The input does not start with a valid zlib header.
    NotZlib,
    /// The input claims to be zlib but the stream is corrupt or truncated.
    Corrupt(String),
}

/// Inflate a zlib stream, classifying the not-a-zlib-stream case by the
/// two-byte header check instead of matching error strings.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, InflateError> {
    if data.len() < 2 || !has_zlib_header(data[0], data[1]) {
        return Err(InflateError::NotZlib);
    }
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| InflateError::Corrupt(e.to_string()))?;
    Ok(out)
}

/// RFC 1950 header check: compression method 8 and a CMF/FLG checksum
/// divisible by 31.
fn has_zlib_header(cmf: u8, flg: u8) -> bool {
    (cmf & 0x0f) == 8 && ((cmf as u16) << 8 | flg as u16) % 31 == 0
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
