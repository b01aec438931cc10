//! Bridge events and the listener registry.
//!
//! Callbacks are keyed by event kind; subscribing returns a
//! [`Subscription`] the caller can invoke to unsubscribe. Dropping the
//! handle without invoking it leaves the listener registered for the
//! session's lifetime.

use crate::core::protocol::envelope::Envelope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

// ── Events ───────────────────────────────────────────────────────────────────

/// Everything the bridge reports to its embedder.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Transport opened; `reconnection` distinguishes recovery opens.
    Connected { reconnection: bool },
    /// Both peers hold the shared secret and exchanged `hello`.
    /// Fires once per session lifecycle (re-fired once on resumption).
    SecureChannelEstablished,
    /// A complete decrypted application message.
    SecureMessage { method: String, params: Value },
    /// Every accepted outer envelope, before decryption.
    RawMessage { envelope: Envelope },
    /// Progress of an in-flight chunk group.
    ChunkReceived {
        group_id: String,
        received: u32,
        expected: u32,
    },
    /// A recoverable protocol, crypto, or origin failure.
    Error { message: String },
    /// The transport never opened successfully.
    FailedToConnect { code: u16, reason: String },
    /// The transport closed.
    Disconnected(Disconnection),
}

/// Details of a transport closure.
#[derive(Debug, Clone)]
pub struct Disconnection {
    pub code: u16,
    pub reason: String,
    pub was_connected: bool,
    pub intentional: bool,
    pub will_reconnect: bool,
}

/// Discriminant used to key listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    SecureChannelEstablished,
    SecureMessage,
    RawMessage,
    ChunkReceived,
    Error,
    FailedToConnect,
    Disconnected,
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::Connected { .. } => EventKind::Connected,
            BridgeEvent::SecureChannelEstablished => EventKind::SecureChannelEstablished,
            BridgeEvent::SecureMessage { .. } => EventKind::SecureMessage,
            BridgeEvent::RawMessage { .. } => EventKind::RawMessage,
            BridgeEvent::ChunkReceived { .. } => EventKind::ChunkReceived,
            BridgeEvent::Error { .. } => EventKind::Error,
            BridgeEvent::FailedToConnect { .. } => EventKind::FailedToConnect,
            BridgeEvent::Disconnected(_) => EventKind::Disconnected,
        }
    }
}

// ── Listener registry ────────────────────────────────────────────────────────

type Listener = Arc<dyn Fn(&BridgeEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(u64, Listener)>>,
}

/// Shared listener registry; clones dispatch to the same listeners.
#[derive(Clone, Default)]
pub struct EventListeners {
    inner: Arc<Mutex<Registry>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        let mut registry = self.inner.lock().expect("listener registry poisoned");
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Dispatch an event to every listener of its kind.
    ///
    /// Listener callbacks run outside the registry lock, so a callback may
    /// subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &BridgeEvent) {
        trace!(kind = ?event.kind(), "Dispatching event");
        let listeners: Vec<Listener> = {
            let registry = self.inner.lock().expect("listener registry poisoned");
            registry
                .by_kind
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Drop every listener (cleanup).
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("listener registry poisoned")
            .by_kind
            .clear();
    }
}

/// Unsubscribe capability returned from [`EventListeners::subscribe`].
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Remove the listener this handle refers to.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.registry.upgrade() {
            let mut registry = inner.lock().expect("listener registry poisoned");
            if let Some(entries) = registry.by_kind.get_mut(&self.kind) {
                entries.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
