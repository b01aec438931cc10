//! Session context: the authoritative per-session record.
//!
//! Holds the role, key material, establishment state, duplicate-suppression
//! set and reassembly buffers for one bridge session. Mutated exclusively
//! under the connection controller's session lock; the invariants below are
//! enforced by the mutators, not by convention:
//!
//! - `shared_secret` is the first 32 bytes of the compressed ECDH point and
//!   never changes once set.
//! - a remote key differing from the stored one is rejected; the stored key
//!   is preserved.
//! - `secure_channel_established` implies both `shared_secret` and
//!   `remote_public_key` are present.

use crate::core::error::BridgeError;
use crate::core::pipeline::chunk::ChunkAccumulator;
use crate::core::security::crypto::{KeyPair, PUBLIC_KEY_SIZE, SHARED_SECRET_SIZE};
use crate::core::security::replay::SeenMessages;
use tracing::{debug, info};
use zeroize::Zeroize;

// ── Role ─────────────────────────────────────────────────────────────────────

/// The two sides of a session.
#[derive(Debug, Clone)]
pub enum Role {
    /// Publishes the connection string; its public key is the bridge id.
    /// `origin` is the origin it declares to the relay.
    Creator { origin: String },
    /// Consumes the connection string; validates that inbound frames carry
    /// the origin encoded in it.
    Joiner { bridge_origin: String },
}

impl Role {
    pub fn is_creator(&self) -> bool {
        matches!(self, Role::Creator { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Creator { .. } => "creator",
            Role::Joiner { .. } => "joiner",
        }
    }
}

// ── Session context ──────────────────────────────────────────────────────────

/// Per-session state record. See module docs for the invariants.
pub struct SessionContext {
    role: Role,
    key_pair: KeyPair,
    bridge_id: String,
    remote_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    shared_secret: Option<[u8; SHARED_SECRET_SIZE]>,
    secure_channel_established: bool,
    resumed_session: bool,
    /// Every JSON-RPC id ever sent or accepted.
    pub seen: SeenMessages,
    /// In-flight chunk groups.
    pub incomplete: ChunkAccumulator,
    last_message_timestamp: u64,
    valid_messages_received: u64,
}

impl SessionContext {
    /// Fresh session, no remote key yet (Creator before handshake).
    pub fn new(role: Role, key_pair: KeyPair, bridge_id: String) -> Self {
        Self {
            role,
            key_pair,
            bridge_id,
            remote_public_key: None,
            shared_secret: None,
            secure_channel_established: false,
            resumed_session: false,
            seen: SeenMessages::new(),
            incomplete: ChunkAccumulator::default(),
            last_message_timestamp: 0,
            valid_messages_received: 0,
        }
    }

    /// Fresh session with the remote key known up front (Joiner): the
    /// shared secret is derived immediately.
    pub fn with_remote_key(
        role: Role,
        key_pair: KeyPair,
        bridge_id: String,
        remote_public_key: &[u8],
    ) -> Result<Self, BridgeError> {
        let mut ctx = Self::new(role, key_pair, bridge_id);
        ctx.adopt_remote_key(remote_public_key)?;
        Ok(ctx)
    }

    /// Resumed session: key material restored from persistence, secure
    /// channel considered established without a handshake.
    pub fn resumed(
        role: Role,
        key_pair: KeyPair,
        bridge_id: String,
        remote_public_key: &[u8],
    ) -> Result<Self, BridgeError> {
        let mut ctx = Self::with_remote_key(role, key_pair, bridge_id, remote_public_key)?;
        ctx.secure_channel_established = true;
        ctx.resumed_session = true;
        info!(role = ctx.role.name(), bridge_id = %ctx.bridge_id, "Session resumed from persisted keys");
        Ok(ctx)
    }

    // ── Key material ─────────────────────────────────────────────────────

    /// Adopt the remote public key and derive the shared secret.
    ///
    /// Idempotent for the same key. A differing key is rejected and the
    /// stored key preserved, whether or not the channel is established —
    /// the secret never changes for the lifetime of the session.
    pub fn adopt_remote_key(&mut self, remote_public_key: &[u8]) -> Result<(), BridgeError> {
        if let Some(existing) = &self.remote_public_key {
            if existing[..] != *remote_public_key {
                return Err(BridgeError::protocol(
                    "handshake with a different remote public key rejected",
                ));
            }
            return Ok(());
        }

        let secret = self.key_pair.derive_shared_secret(remote_public_key)?;
        let mut stored = [0u8; PUBLIC_KEY_SIZE];
        stored.copy_from_slice(remote_public_key);
        self.remote_public_key = Some(stored);
        self.shared_secret = Some(secret);
        debug!(role = self.role.name(), "Shared secret derived");
        Ok(())
    }

    /// The derived AEAD key, present once the remote key is adopted.
    pub fn shared_secret(&self) -> Option<&[u8; SHARED_SECRET_SIZE]> {
        self.shared_secret.as_ref()
    }

    pub fn remote_public_key(&self) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        self.remote_public_key.as_ref()
    }

    pub fn remote_public_key_hex(&self) -> Option<String> {
        self.remote_public_key.as_ref().map(hex::encode)
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    // ── Establishment ────────────────────────────────────────────────────

    /// Mark the secure channel established. Returns `true` on the first
    /// call only, so the establishment event fires exactly once.
    ///
    /// Callable only once the shared secret exists; this is what keeps the
    /// `established ⇒ keys present` invariant.
    pub fn mark_established(&mut self) -> bool {
        debug_assert!(self.shared_secret.is_some() && self.remote_public_key.is_some());
        if self.secure_channel_established {
            return false;
        }
        self.secure_channel_established = true;
        info!(role = self.role.name(), bridge_id = %self.bridge_id, "Secure channel established");
        true
    }

    pub fn is_established(&self) -> bool {
        self.secure_channel_established
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed_session
    }

    // ── Message bookkeeping ──────────────────────────────────────────────

    /// Accept an inbound message id: dedup, counter, liveness timestamp.
    /// Returns `false` for duplicates, which the caller must drop.
    pub fn accept_inbound(&mut self, id: &str, now_ms: u64) -> bool {
        if !self.seen.record(id) {
            return false;
        }
        self.valid_messages_received += 1;
        self.last_message_timestamp = now_ms;
        true
    }

    /// Record an outbound id so the relay echoing our own frame back is
    /// dropped as a duplicate.
    pub fn record_outbound(&mut self, id: &str) {
        self.seen.record(id);
    }

    pub fn valid_messages_received(&self) -> u64 {
        self.valid_messages_received
    }

    pub fn last_message_timestamp(&self) -> u64 {
        self.last_message_timestamp
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Scrub key material and reassembly state. The context is unusable
    /// for messaging afterwards.
    pub fn cleanup(&mut self) {
        if let Some(secret) = self.shared_secret.as_mut() {
            secret.zeroize();
        }
        self.shared_secret = None;
        self.remote_public_key = None;
        self.secure_channel_established = false;
        self.incomplete.clear();
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        if let Some(secret) = self.shared_secret.as_mut() {
            secret.zeroize();
        }
    }
}
