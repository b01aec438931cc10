//! Transport abstraction and connection management.
//!
//! A transport is anything that can open a URL into a duplex text-frame
//! channel: the production WebSocket client, or the in-memory relay used
//! by tests. Implementations are injected at construction through the
//! [`Connector`] trait; the controller never names a concrete transport.

pub mod controller;
pub mod memory;
pub mod uri;
pub mod websocket;

use crate::core::error::BridgeError;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

/// Parameters for opening one transport connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Fully built relay URL (including `id` and optional `moc` params).
    pub url: String,
    /// Value for the `Origin` upgrade header, when the environment has one.
    pub origin: Option<String>,
}

/// Frames and control flowing toward the transport.
#[derive(Debug)]
pub enum Outbound {
    /// A text frame to deliver.
    Frame(String),
    /// Close the connection with a code and reason.
    Close { code: u16, reason: String },
}

/// Everything the transport reports back.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A text frame arrived.
    Frame(String),
    /// The connection closed; emitted exactly once.
    Closed {
        code: u16,
        reason: String,
        was_clean: bool,
    },
}

/// One open duplex channel.
///
/// Dropping `sender` tears the write side down; the read side reports the
/// resulting closure through `events`.
pub struct Connection {
    pub sender: mpsc::UnboundedSender<Outbound>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Opens connections. Implemented by [`websocket::WebSocketConnector`]
/// for production and [`memory::MemoryConnector`] for tests.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, BridgeError>>;
}
