//! Public facade: `create` / `join` and the `Bridge` handle.
//!
//! `create` publishes a session as the Creator and hands back the
//! connection string to share; `join` consumes a connection string as the
//! Joiner and dials in immediately. Both return the same [`Bridge`]
//! surface: event subscriptions, `send_message`, state getters and
//! `close`.

use crate::core::config::{
    CHUNK_WAIT, DEFAULT_BRIDGE_URL, MAX_RECONNECT_ATTEMPTS, PING_INTERVAL, RECONNECT_BASE_DELAY,
};
use crate::core::connection::controller::{ConnectionController, ControllerConfig};
use crate::core::connection::uri::{normalize_domain, ConnectionString};
use crate::core::connection::websocket::WebSocketConnector;
use crate::core::connection::Connector;
use crate::core::error::BridgeError;
use crate::core::events::{
    BridgeEvent, Disconnection, EventKind, EventListeners, Subscription,
};
use crate::core::protocol::coordinator::SessionCoordinator;
use crate::core::protocol::envelope::Envelope;
use crate::core::security::crypto::{KeyPair, PUBLIC_KEY_SIZE};
use crate::core::security::session::{Role, SessionContext};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// ── Options ──────────────────────────────────────────────────────────────────

/// Options accepted by [`create`] and [`join`].
#[derive(Clone)]
pub struct BridgeOptions {
    /// Session key pair; generated when absent. Required for resumption.
    pub key_pair: Option<KeyPair>,
    /// Hex of the peer's compressed public key. Only valid together with
    /// `resume` (Creator side).
    pub remote_public_key: Option<String>,
    /// Declared origin. Required for `create` in this non-browser
    /// implementation; ignored by `join`.
    pub origin: Option<String>,
    /// Relay endpoint.
    pub bridge_url: String,
    /// Open the transport from `create` immediately (default). `join`
    /// always connects.
    pub autoconnect: bool,
    /// Resume a previously established session from persisted keys.
    pub resume: bool,
    /// Reconnect with backoff after unexpected closes.
    pub reconnect: bool,
    pub ping_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    /// Pacing between chunks of one message.
    pub chunk_wait: Duration,
    /// Transport override; defaults to the WebSocket client.
    pub connector: Option<Arc<dyn Connector>>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            key_pair: None,
            remote_public_key: None,
            origin: None,
            bridge_url: DEFAULT_BRIDGE_URL.to_string(),
            autoconnect: true,
            resume: false,
            reconnect: true,
            ping_interval: PING_INTERVAL,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            chunk_wait: CHUNK_WAIT,
            connector: None,
        }
    }
}

impl std::fmt::Debug for BridgeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeOptions")
            .field("key_pair", &self.key_pair)
            .field("origin", &self.origin)
            .field("bridge_url", &self.bridge_url)
            .field("autoconnect", &self.autoconnect)
            .field("resume", &self.resume)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Open a session as the Creator and publish its connection string.
///
/// Must be called within a tokio runtime when `autoconnect` or `resume`
/// is set.
pub fn create(options: BridgeOptions) -> Result<Bridge, BridgeError> {
    if options.remote_public_key.is_some() && !options.resume {
        return Err(BridgeError::configuration(
            "a remote public key may only be supplied when resuming a session",
        ));
    }
    if options.resume && (options.key_pair.is_none() || options.remote_public_key.is_none()) {
        return Err(BridgeError::configuration(
            "resuming requires both the session key pair and the remote public key",
        ));
    }
    let origin = options
        .origin
        .clone()
        .ok_or_else(|| BridgeError::configuration("origin is required outside the browser"))?;

    let key_pair = options.key_pair.clone().unwrap_or_else(KeyPair::generate);
    let bridge_id = key_pair.public_key_hex();
    let role = Role::Creator {
        origin: origin.clone(),
    };

    let ctx = if options.resume {
        let remote = decode_remote_key(options.remote_public_key.as_deref().unwrap_or_default())?;
        SessionContext::resumed(role, key_pair.clone(), bridge_id.clone(), &remote)?
    } else {
        SessionContext::new(role, key_pair.clone(), bridge_id.clone())
    };

    let connection_string = ConnectionString::new(bridge_id.clone(), origin);
    info!(bridge_id = %bridge_id, resume = options.resume, "Creating bridge");
    let autoconnect = options.autoconnect || options.resume;
    let bridge = Bridge::build(ctx, key_pair, bridge_id, connection_string, options);
    if autoconnect {
        bridge.connect();
    }
    Ok(bridge)
}

/// Join a session from a scanned connection string. Always connects.
pub fn join(uri: &str, options: BridgeOptions) -> Result<Bridge, BridgeError> {
    let connection_string: ConnectionString = uri.parse()?;
    let bridge_origin = normalize_domain(&connection_string.origin);
    let remote = decode_remote_key(&connection_string.bridge_id)?;

    if options.resume && options.key_pair.is_none() {
        return Err(BridgeError::configuration(
            "resuming requires the session key pair",
        ));
    }
    let key_pair = options.key_pair.clone().unwrap_or_else(KeyPair::generate);
    let role = Role::Joiner { bridge_origin };

    let ctx = if options.resume {
        SessionContext::resumed(
            role,
            key_pair.clone(),
            connection_string.bridge_id.clone(),
            &remote,
        )?
    } else {
        SessionContext::with_remote_key(
            role,
            key_pair.clone(),
            connection_string.bridge_id.clone(),
            &remote,
        )?
    };

    let bridge_id = connection_string.bridge_id.clone();
    info!(bridge_id = %bridge_id, resume = options.resume, "Joining bridge");
    let bridge = Bridge::build(ctx, key_pair, bridge_id, connection_string, options);
    bridge.connect();
    Ok(bridge)
}

fn decode_remote_key(hex_key: &str) -> Result<Vec<u8>, BridgeError> {
    let bytes = hex::decode(hex_key)
        .map_err(|_| BridgeError::configuration("remote public key is not hex"))?;
    if bytes.len() != PUBLIC_KEY_SIZE {
        return Err(BridgeError::configuration(format!(
            "remote public key must be {PUBLIC_KEY_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

// ── Bridge handle ────────────────────────────────────────────────────────────

/// Handle to one session. Dropping the handle closes the session.
pub struct Bridge {
    controller: ConnectionController,
    listeners: EventListeners,
    key_pair: KeyPair,
    bridge_id: String,
    connection_string: ConnectionString,
    started: AtomicBool,
}

impl Bridge {
    fn build(
        ctx: SessionContext,
        key_pair: KeyPair,
        bridge_id: String,
        connection_string: ConnectionString,
        options: BridgeOptions,
    ) -> Self {
        let listeners = EventListeners::new();
        let connector: Arc<dyn Connector> = options
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));
        let controller = ConnectionController::new(
            SessionCoordinator::new(ctx),
            listeners.clone(),
            connector,
            ControllerConfig {
                bridge_url: options.bridge_url,
                ping_interval: options.ping_interval,
                reconnect: options.reconnect,
                max_reconnect_attempts: options.max_reconnect_attempts,
                reconnect_base_delay: options.reconnect_base_delay,
                chunk_wait: options.chunk_wait,
            },
        );
        Self {
            controller,
            listeners,
            key_pair,
            bridge_id,
            connection_string,
            started: AtomicBool::new(false),
        }
    }

    /// Open the transport. No-op once started.
    pub fn connect(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.controller.start();
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    /// Transport opened; the argument is `true` for reconnections.
    pub fn on_connect<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe(EventKind::Connected, move |event| {
            if let BridgeEvent::Connected { reconnection } = event {
                listener(*reconnection);
            }
        })
    }

    pub fn on_secure_channel_established<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners
            .subscribe(EventKind::SecureChannelEstablished, move |_| listener())
    }

    /// A complete decrypted message: `(method, params)`.
    pub fn on_secure_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.listeners.subscribe(EventKind::SecureMessage, move |event| {
            if let BridgeEvent::SecureMessage { method, params } = event {
                listener(method, params);
            }
        })
    }

    /// Every accepted outer envelope, before decryption.
    pub fn on_raw_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.listeners.subscribe(EventKind::RawMessage, move |event| {
            if let BridgeEvent::RawMessage { envelope } = event {
                listener(envelope);
            }
        })
    }

    /// Chunk-group progress: `(group_id, received, expected)`.
    pub fn on_chunk_received<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str, u32, u32) + Send + Sync + 'static,
    {
        self.listeners.subscribe(EventKind::ChunkReceived, move |event| {
            if let BridgeEvent::ChunkReceived {
                group_id,
                received,
                expected,
            } = event
            {
                listener(group_id, *received, *expected);
            }
        })
    }

    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.subscribe(EventKind::Error, move |event| {
            if let BridgeEvent::Error { message } = event {
                listener(message);
            }
        })
    }

    pub fn on_failed_to_connect<F>(&self, listener: F) -> Subscription
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        self.listeners
            .subscribe(EventKind::FailedToConnect, move |event| {
                if let BridgeEvent::FailedToConnect { code, reason } = event {
                    listener(*code, reason);
                }
            })
    }

    pub fn on_disconnect<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Disconnection) + Send + Sync + 'static,
    {
        self.listeners.subscribe(EventKind::Disconnected, move |event| {
            if let BridgeEvent::Disconnected(details) = event {
                listener(details);
            }
        })
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// Encrypt and send one message. `false` on any failure.
    pub async fn send_message(&self, method: &str, params: Value) -> bool {
        self.controller.send_message(method, &params).await
    }

    pub fn is_bridge_connected(&self) -> bool {
        self.controller.is_connected()
    }

    pub fn is_secure_channel_established(&self) -> bool {
        self.controller.is_secure_channel_established()
    }

    /// Own public key, hex.
    pub fn get_public_key(&self) -> String {
        self.key_pair.public_key_hex()
    }

    /// Peer public key, hex, once known.
    pub fn get_remote_public_key(&self) -> Option<String> {
        self.controller.with_session(|session| session.remote_public_key_hex())
    }

    /// The session key pair, for resumption persistence.
    pub fn get_key_pair(&self) -> KeyPair {
        self.key_pair.clone()
    }

    /// The relay topic id.
    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }

    /// The shareable `obsidion:` connection string.
    pub fn connection_string(&self) -> String {
        self.connection_string.to_string()
    }

    /// Close the session: transport close 1000, key material scrubbed,
    /// listeners released.
    pub fn close(&self) {
        self.controller.cleanup();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.controller.cleanup();
    }
}
