//! Error taxonomy for the bridge.
//!
//! Only [`BridgeError::Configuration`] is raised synchronously from the
//! facade; everything else surfaces through the event stream
//! (`Error`, `Disconnected`, `FailedToConnect`) or as a `false` return
//! from `send_message`.

use thiserror::Error;

/// All failure modes the bridge reports.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Invalid options or malformed connection string. Raised synchronously
    /// from `create` / `join`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport open failed or closed abnormally before the first open
    /// succeeded.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or inadmissible frame: chunk length mismatch, invalid
    /// greeting, oversized envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// AEAD tag mismatch, invalid key material, or a corrupt compressed
    /// payload.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Joiner-side origin check failed: the relay-attached origin does not
    /// match the origin from the connection string.
    #[error("origin mismatch: expected {expected}, received {received}")]
    OriginMismatch { expected: String, received: String },
}

impl BridgeError {
    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::Configuration(detail.into())
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport(detail.into())
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }

    pub fn crypto(detail: impl Into<String>) -> Self {
        Self::Crypto(detail.into())
    }
}

impl From<secp256k1::Error> for BridgeError {
    fn from(e: secp256k1::Error) -> Self {
        Self::Crypto(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(format!("JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_mismatch_names_both_values() {
        let err = BridgeError::OriginMismatch {
            expected: "https://a.example".into(),
            received: "https://b.example".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("origin"));
        assert!(msg.contains("https://a.example"));
        assert!(msg.contains("https://b.example"));
    }
}
