//! Connection strings and relay URLs.
//!
//! The Creator publishes `obsidion:<hex-public-key>?d=<origin>`; the
//! Joiner scans it and dials the relay at
//! `<bridgeUrl>?id=<bridge_id>[&moc=<base64 handshake envelope>]`.

use crate::core::error::BridgeError;
use crate::core::protocol::envelope::Envelope;
use crate::core::security::crypto::PUBLIC_KEY_SIZE;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// URI scheme of the connection string.
pub const CONNECTION_SCHEME: &str = "obsidion";

/// The rendezvous coordinates the Creator shares (usually as a QR code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// Hex of the Creator's 33-byte compressed public key.
    pub bridge_id: String,
    /// The Creator's declared origin.
    pub origin: String,
}

impl ConnectionString {
    pub fn new(bridge_id: String, origin: String) -> Self {
        Self { bridge_id, origin }
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CONNECTION_SCHEME}:{}?d={}", self.bridge_id, self.origin)
    }
}

impl FromStr for ConnectionString {
    type Err = BridgeError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let parsed = Url::parse(uri)
            .map_err(|e| BridgeError::configuration(format!("invalid connection string: {e}")))?;
        if parsed.scheme() != CONNECTION_SCHEME {
            return Err(BridgeError::configuration(format!(
                "connection string must use the {CONNECTION_SCHEME}: scheme, got {}:",
                parsed.scheme()
            )));
        }

        let bridge_id = parsed.path().to_string();
        let decoded = hex::decode(&bridge_id).map_err(|_| {
            BridgeError::configuration("connection string public key is not hex")
        })?;
        if decoded.len() != PUBLIC_KEY_SIZE {
            return Err(BridgeError::configuration(format!(
                "connection string public key must be {PUBLIC_KEY_SIZE} bytes, got {}",
                decoded.len()
            )));
        }

        let origin = parsed
            .query_pairs()
            .find(|(key, _)| key == "d")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                BridgeError::configuration("connection string is missing the d= origin parameter")
            })?;

        Ok(Self { bridge_id, origin })
    }
}

/// Normalize the Joiner-side domain: prefix `https://` when no scheme is
/// present and the value is not the literal non-browser token.
pub fn normalize_domain(domain: &str) -> String {
    if domain == crate::core::config::NODEJS_ORIGIN || domain.contains("://") {
        domain.to_string()
    } else {
        format!("https://{domain}")
    }
}

/// Build the relay URL for one connection attempt.
///
/// `moc` carries the Joiner's handshake envelope for the relay to
/// broadcast on connect (message-on-connect); the Creator, and a Joiner
/// whose channel is already established, connect with the bare topic id.
pub fn build_ws_url(
    bridge_url: &str,
    bridge_id: &str,
    moc: Option<&Envelope>,
) -> Result<String, BridgeError> {
    let mut url = Url::parse(bridge_url)
        .map_err(|e| BridgeError::configuration(format!("invalid bridge url: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("id", bridge_id);
        if let Some(envelope) = moc {
            let frame = envelope
                .to_frame()
                .map_err(|e| BridgeError::configuration(format!("cannot encode moc: {e}")))?;
            pairs.append_pair("moc", &BASE64.encode(frame));
        }
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::envelope::METHOD_HANDSHAKE;
    use crate::core::security::crypto::KeyPair;

    fn some_bridge_id() -> String {
        KeyPair::generate().public_key_hex()
    }

    #[test]
    fn test_connection_string_roundtrip() {
        let original = ConnectionString::new(some_bridge_id(), "https://localhost".into());
        let uri = original.to_string();
        assert!(uri.starts_with(&format!("obsidion:{}", original.bridge_id)));
        assert!(uri.contains("d=https://localhost"));

        let parsed: ConnectionString = uri.parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_missing_origin_rejected() {
        let uri = format!("obsidion:{}", some_bridge_id());
        assert!(matches!(
            uri.parse::<ConnectionString>(),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn test_wrong_scheme_rejected() {
        let uri = format!("wss:{}?d=https://localhost", some_bridge_id());
        assert!(uri.parse::<ConnectionString>().is_err());
    }

    #[test]
    fn test_malformed_public_key_rejected() {
        assert!("obsidion:zznothex?d=https://x".parse::<ConnectionString>().is_err());
        assert!("obsidion:02ab?d=https://x".parse::<ConnectionString>().is_err());
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("example.com"), "https://example.com");
        assert_eq!(normalize_domain("https://example.com"), "https://example.com");
        assert_eq!(normalize_domain("http://localhost"), "http://localhost");
        assert_eq!(normalize_domain("nodejs"), "nodejs");
    }

    #[test]
    fn test_ws_url_with_bare_topic() {
        let bridge_id = some_bridge_id();
        let url = build_ws_url("wss://bridge.example", &bridge_id, None).unwrap();
        assert_eq!(url, format!("wss://bridge.example/?id={bridge_id}"));
    }

    #[test]
    fn test_ws_url_with_moc_is_percent_encoded_base64() {
        let bridge_id = some_bridge_id();
        let envelope = Envelope::new(
            METHOD_HANDSHAKE,
            serde_json::json!({"pubkey": "02ab", "greeting": "cdef"}),
        );
        let url = build_ws_url("wss://bridge.example", &bridge_id, Some(&envelope)).unwrap();

        let parsed = Url::parse(&url).unwrap();
        let moc = parsed
            .query_pairs()
            .find(|(k, _)| k == "moc")
            .map(|(_, v)| v.into_owned())
            .expect("moc param present");
        let frame = BASE64.decode(moc.as_bytes()).unwrap();
        let decoded = Envelope::parse(std::str::from_utf8(&frame).unwrap()).unwrap();
        assert_eq!(decoded.method, METHOD_HANDSHAKE);
    }
}
