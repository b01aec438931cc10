//! Session coordinator: the role-aware state machine.
//!
//! Single authority for frame routing, handshake validation, duplicate
//! suppression and secure-message dispatch. It is a pure state machine
//! that returns declarative side-effects — frames to put on the wire and
//! events to surface — and performs no I/O itself; the connection
//! controller executes the outcome while holding the session lock across
//! the full handling of one frame.
//!
//! Routing order for every inbound frame:
//! `ping`/`pong` control first, then id bookkeeping (missing id dropped,
//! duplicate dropped, fresh id recorded), then dispatch by method.

use crate::core::config::REPLAY_LOOKBACK;
use crate::core::error::BridgeError;
use crate::core::events::BridgeEvent;
use crate::core::pipeline::receiver::{self, Inbound};
use crate::core::pipeline::sender;
use crate::core::protocol::envelope::{
    reduce_origin, Envelope, METHOD_ENCRYPTED_MESSAGE, METHOD_ERROR, METHOD_HANDSHAKE,
    METHOD_PING, METHOD_PONG, METHOD_REPLAY,
};
use crate::core::security::crypto;
use crate::core::security::session::{Role, SessionContext};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Plaintext both peers prove knowledge of the shared secret with.
const GREETING: &[u8] = b"hello";

// ── Outcome ──────────────────────────────────────────────────────────────────

/// A frame the controller must put on the wire.
#[derive(Debug)]
pub enum Action {
    SendFrame(String),
}

/// Declarative result of one coordinator operation.
#[derive(Debug, Default)]
pub struct Outcome {
    pub actions: Vec<Action>,
    pub events: Vec<BridgeEvent>,
}

impl Outcome {
    fn empty() -> Self {
        Self::default()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.events.push(BridgeEvent::Error {
            message: message.into(),
        });
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────────

/// Role-aware session state machine over one [`SessionContext`].
pub struct SessionCoordinator {
    ctx: SessionContext,
}

impl SessionCoordinator {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn is_established(&self) -> bool {
        self.ctx.is_established()
    }

    /// Scrub the session (user-initiated cleanup).
    pub fn cleanup(&mut self) {
        self.ctx.cleanup();
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Process one raw text frame from the relay.
    pub fn handle_frame(&mut self, raw: &str, now_ms: u64) -> Outcome {
        let mut outcome = Outcome::empty();

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Dropping unparseable frame");
                return outcome;
            }
        };

        // Liveness control runs before id bookkeeping.
        match envelope.method.as_str() {
            METHOD_PING => {
                let pong = Envelope::pong();
                if let Some(id) = pong.message_id() {
                    self.ctx.record_outbound(id);
                }
                if let Ok(frame) = pong.to_frame() {
                    outcome.actions.push(Action::SendFrame(frame));
                }
                return outcome;
            }
            METHOD_PONG => return outcome,
            _ => {}
        }

        let Some(id) = envelope.message_id().map(str::to_string) else {
            debug!(method = %envelope.method, "Dropping frame without id");
            return outcome;
        };
        if !self.ctx.accept_inbound(&id, now_ms) {
            debug!(%id, method = %envelope.method, "Dropping duplicate frame");
            return outcome;
        }

        self.ctx.incomplete.evict_stale();
        outcome.events.push(BridgeEvent::RawMessage {
            envelope: envelope.clone(),
        });

        match envelope.method.as_str() {
            METHOD_HANDSHAKE => self.handle_handshake(&envelope, &mut outcome),
            METHOD_ENCRYPTED_MESSAGE => self.handle_encrypted(&envelope, &mut outcome),
            METHOD_ERROR => {
                let message = envelope
                    .params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified peer error");
                warn!(message, "Peer reported an error");
                outcome.error(format!("peer error: {message}"));
            }
            other => {
                debug!(method = other, "Ignoring frame with unhandled method");
            }
        }
        outcome
    }

    /// Creator side of the handshake (§ the Joiner never receives one).
    fn handle_handshake(&mut self, envelope: &Envelope, outcome: &mut Outcome) {
        if !self.ctx.role().is_creator() {
            debug!("Joiner ignoring handshake frame");
            return;
        }

        let (Some(pubkey_hex), Some(greeting_hex)) = (
            envelope.params.get("pubkey").and_then(Value::as_str),
            envelope.params.get("greeting").and_then(Value::as_str),
        ) else {
            outcome.error("handshake missing pubkey or greeting");
            return;
        };

        let remote_key = match hex::decode(pubkey_hex) {
            Ok(bytes) => bytes,
            Err(e) => {
                outcome.error(format!("handshake pubkey is not hex: {e}"));
                return;
            }
        };

        if let Err(e) = self.ctx.adopt_remote_key(&remote_key) {
            // A different key after establishment: tell the impostor no,
            // keep the session keyed as-is.
            let reply = Envelope::error("handshake rejected: key differs from established session");
            if let Some(id) = reply.message_id() {
                self.ctx.record_outbound(id);
            }
            if let Ok(frame) = reply.to_frame() {
                outcome.actions.push(Action::SendFrame(frame));
            }
            outcome.error(e.to_string());
            return;
        }

        let Some(shared_secret) = self.ctx.shared_secret().copied() else {
            outcome.error("handshake accepted but no shared secret derived");
            return;
        };
        let bridge_id = self.ctx.bridge_id().to_string();

        let greeting = match hex::decode(greeting_hex) {
            Ok(bytes) => bytes,
            Err(e) => {
                outcome.error(format!("handshake greeting is not hex: {e}"));
                return;
            }
        };
        match crypto::decrypt(&greeting, &shared_secret, &bridge_id) {
            Ok(plaintext) if plaintext == GREETING => {}
            Ok(_) => {
                outcome.error("handshake greeting did not decrypt to the expected value");
                return;
            }
            Err(e) => {
                outcome.error(format!("handshake greeting rejected: {e}"));
                return;
            }
        }

        match sender::encode_hello(&shared_secret, &bridge_id) {
            Ok(reply) => {
                if let Some(id) = reply.message_id() {
                    self.ctx.record_outbound(id);
                }
                match reply.to_frame() {
                    Ok(frame) => outcome.actions.push(Action::SendFrame(frame)),
                    Err(e) => {
                        outcome.error(format!("failed to encode hello reply: {e}"));
                        return;
                    }
                }
            }
            Err(e) => {
                outcome.error(format!("failed to encrypt hello reply: {e}"));
                return;
            }
        }

        info!(remote = pubkey_hex, "Handshake accepted");
        if self.ctx.mark_established() {
            outcome.events.push(BridgeEvent::SecureChannelEstablished);
        }
    }

    fn handle_encrypted(&mut self, envelope: &Envelope, outcome: &mut Outcome) {
        // The Joiner trusts only frames the relay stamped with the origin
        // it scanned out of the connection string.
        if let Role::Joiner { bridge_origin } = self.ctx.role() {
            let expected = reduce_origin(bridge_origin);
            let received = reduce_origin(envelope.origin.as_deref().unwrap_or(""));
            if expected != received {
                warn!(%expected, %received, "Dropping frame with mismatched origin");
                outcome.error(
                    BridgeError::OriginMismatch { expected, received }.to_string(),
                );
                return;
            }
        }

        let Some(payload) = envelope.payload() else {
            outcome.error("encryptedMessage without payload");
            return;
        };
        let Some(shared_secret) = self.ctx.shared_secret().copied() else {
            outcome.error("encrypted message received before key exchange");
            return;
        };
        let bridge_id = self.ctx.bridge_id().to_string();
        let established = self.ctx.is_established();

        match receiver::decode_secure(
            payload,
            &shared_secret,
            &bridge_id,
            established,
            &mut self.ctx.incomplete,
        ) {
            Ok(Inbound::Hello) => {
                if self.ctx.mark_established() {
                    outcome.events.push(BridgeEvent::SecureChannelEstablished);
                }
            }
            Ok(Inbound::Message { method, params }) => {
                outcome.events.push(BridgeEvent::SecureMessage { method, params });
            }
            Ok(Inbound::Chunk {
                group_id,
                received,
                expected,
            }) => {
                outcome.events.push(BridgeEvent::ChunkReceived {
                    group_id,
                    received,
                    expected,
                });
            }
            Err(e) => outcome.error(e.to_string()),
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Encode one secure message into wire frames, in send order.
    /// Every outer id is recorded so relay echoes are dropped.
    pub fn encode_secure_message(
        &mut self,
        method: &str,
        params: &Value,
    ) -> Result<Vec<String>, BridgeError> {
        if !self.ctx.is_established() {
            return Err(BridgeError::protocol("secure channel not established"));
        }
        let shared_secret = *self
            .ctx
            .shared_secret()
            .ok_or_else(|| BridgeError::protocol("session has no shared secret"))?;
        let bridge_id = self.ctx.bridge_id().to_string();

        let envelopes = sender::encode_secure(method, params, &shared_secret, &bridge_id)?;
        let mut frames = Vec::with_capacity(envelopes.len());
        for envelope in &envelopes {
            if let Some(id) = envelope.message_id() {
                self.ctx.record_outbound(id);
            }
            frames.push(envelope.to_frame()?);
        }
        Ok(frames)
    }

    /// The Joiner's handshake envelope (delivered via the relay's
    /// message-on-connect parameter).
    pub fn handshake_envelope(&mut self) -> Result<Envelope, BridgeError> {
        let shared_secret = *self
            .ctx
            .shared_secret()
            .ok_or_else(|| BridgeError::protocol("joiner has no shared secret yet"))?;
        let bridge_id = self.ctx.bridge_id().to_string();

        let greeting = hex::encode(crypto::encrypt(GREETING, &shared_secret, &bridge_id)?);
        let envelope = Envelope::new(
            METHOD_HANDSHAKE,
            serde_json::json!({
                "pubkey": self.ctx.key_pair().public_key_hex(),
                "greeting": greeting,
            }),
        );
        if let Some(id) = envelope.message_id() {
            self.ctx.record_outbound(id);
        }
        Ok(envelope)
    }

    /// A keepalive ping frame.
    pub fn ping_frame(&mut self) -> Result<String, BridgeError> {
        let envelope = Envelope::new(METHOD_PING, serde_json::json!({}));
        if let Some(id) = envelope.message_id() {
            self.ctx.record_outbound(id);
        }
        envelope.to_frame()
    }

    /// The replay request sent after a reconnect, reaching back behind the
    /// last accepted message. `None` before any message has been accepted.
    pub fn replay_frame(&mut self) -> Result<Option<String>, BridgeError> {
        let last = self.ctx.last_message_timestamp();
        if last == 0 {
            return Ok(None);
        }
        let timestamp = last.saturating_sub(REPLAY_LOOKBACK.as_millis() as u64);
        let envelope = Envelope::new(METHOD_REPLAY, serde_json::json!({ "timestamp": timestamp }));
        if let Some(id) = envelope.message_id() {
            self.ctx.record_outbound(id);
        }
        Ok(Some(envelope.to_frame()?))
    }
}
