//! End-to-end encrypted, bidirectional message channel between two peers
//! whose only rendezvous is an untrusted WebSocket relay.
//!
//! The **Creator** opens a session and publishes a connection string
//! (`obsidion:<public-key-hex>?d=<origin>`, usually rendered as a QR
//! code); the **Joiner** scans it, precomputes the shared secret from the
//! embedded public key, and dials the same relay topic. One ECDH
//! handshake later both sides hold an AES-256-GCM channel the relay
//! cannot read:
//!
//! - secp256k1 ECDH with fresh keys per session; the first 32 bytes of
//!   the compressed shared point are the AEAD key
//! - deterministic session nonce (`SHA-256(bridge_id)[..12]`); message
//!   uniqueness comes from id-level duplicate suppression, not nonce
//!   rotation
//! - JSON-RPC envelopes with deflate compression and 16 KB chunking for
//!   large payloads, reassembled in order per chunk group
//! - ping keepalive, exponential-backoff reconnection, and timestamped
//!   replay requests so a dropped transport loses nothing
//! - session resumption from persisted key material, skipping the
//!   handshake entirely
//!
//! ```no_run
//! use obsidion_bridge::{create, join, BridgeOptions};
//!
//! # async fn demo() -> Result<(), obsidion_bridge::BridgeError> {
//! let creator = create(BridgeOptions {
//!     origin: Some("https://localhost".into()),
//!     ..BridgeOptions::default()
//! })?;
//! println!("scan me: {}", creator.connection_string());
//!
//! let joiner = join(&creator.connection_string(), BridgeOptions::default())?;
//! let _sub = joiner.on_secure_message(|method, params| {
//!     println!("{method}: {params}");
//! });
//! creator.send_message("hello, world?", serde_json::json!({})).await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod core;

pub use crate::bridge::{create, join, Bridge, BridgeOptions};
pub use crate::core::connection::memory::{MemoryConnector, MemoryRelay};
pub use crate::core::connection::uri::ConnectionString;
pub use crate::core::connection::websocket::WebSocketConnector;
pub use crate::core::connection::{
    ConnectRequest, Connection, ConnectionEvent, Connector, Outbound,
};
pub use crate::core::error::BridgeError;
pub use crate::core::events::{BridgeEvent, Disconnection, EventKind, Subscription};
pub use crate::core::protocol::envelope::Envelope;
pub use crate::core::security::crypto::KeyPair;
