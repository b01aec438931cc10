//! Connection controller: transport lifecycle for one session.
//!
//! Supervises a single logical connection to the relay: opens the
//! transport, pumps inbound frames through the session coordinator while
//! holding the session lock across each frame, keeps the link alive with
//! periodic pings, reconnects with exponential backoff, and asks the
//! relay to replay missed frames after a successful reconnect.
//!
//! The session lock is a plain mutex: the coordinator is synchronous and
//! the lock is never held across an await point.

use crate::core::config::{
    CHUNK_WAIT, CLOSE_CODE_USER, CLOSE_REASON_USER, DEFAULT_BRIDGE_URL, MAX_RECONNECT_ATTEMPTS,
    NODEJS_ORIGIN, PING_INTERVAL, RECONNECT_BASE_DELAY,
};
use crate::core::connection::uri::build_ws_url;
use crate::core::connection::{ConnectRequest, Connection, ConnectionEvent, Connector, Outbound};
use crate::core::error::BridgeError;
use crate::core::events::{BridgeEvent, Disconnection, EventListeners};
use crate::core::protocol::coordinator::{Action, SessionCoordinator};
use crate::core::security::session::{Role, SessionContext};
use crate::core::stop::StopSignal;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

// ── Configuration ────────────────────────────────────────────────────────────

/// Runtime knobs of the controller; defaults come from `config`.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bridge_url: String,
    pub ping_interval: Duration,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub chunk_wait: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bridge_url: DEFAULT_BRIDGE_URL.to_string(),
            ping_interval: PING_INTERVAL,
            reconnect: true,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            chunk_wait: CHUNK_WAIT,
        }
    }
}

// ── Controller ───────────────────────────────────────────────────────────────

/// Handle to one supervised session connection.
#[derive(Clone)]
pub struct ConnectionController {
    shared: Arc<Shared>,
}

struct Shared {
    coordinator: Mutex<SessionCoordinator>,
    listeners: EventListeners,
    connector: Arc<dyn Connector>,
    config: ControllerConfig,
    stop: StopSignal,
    connected: AtomicBool,
    intentional: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

/// Why the read loop ended.
enum ReadEnd {
    /// Cancelled by cleanup.
    Stopped,
    /// The transport closed.
    Closed {
        code: u16,
        reason: String,
        was_clean: bool,
    },
}

impl ConnectionController {
    pub fn new(
        coordinator: SessionCoordinator,
        listeners: EventListeners,
        connector: Arc<dyn Connector>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                coordinator: Mutex::new(coordinator),
                listeners,
                connector,
                config,
                stop: StopSignal::new(),
                connected: AtomicBool::new(false),
                intentional: AtomicBool::new(false),
                sender: Mutex::new(None),
            }),
        }
    }

    /// Spawn the supervision task. Idempotent per controller instance is
    /// not required; the facade calls it once.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(shared.run());
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_secure_channel_established(&self) -> bool {
        self.shared.lock_session().is_established()
    }

    /// Read access to session state for facade getters.
    pub fn with_session<R>(&self, f: impl FnOnce(&SessionContext) -> R) -> R {
        f(self.shared.lock_session().context())
    }

    /// Encrypt and send one message, pacing chunks apart. Returns `false`
    /// on any failure: channel not established, transport gone, encode
    /// error, or session already cleaned up.
    pub async fn send_message(&self, method: &str, params: &Value) -> bool {
        if self.shared.stop.cancelled() || !self.is_connected() {
            return false;
        }
        let frames = match self.shared.lock_session().encode_secure_message(method, params) {
            Ok(frames) => frames,
            Err(e) => {
                debug!(error = %e, method, "send_message failed to encode");
                return false;
            }
        };

        for (index, frame) in frames.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.shared.config.chunk_wait).await;
            }
            // Re-read the sender every frame; the connection may turn over
            // mid-send and the rest of the chunk group is then lost.
            let sender = self.shared.sender.lock().expect("sender lock").clone();
            let Some(sender) = sender else {
                return false;
            };
            if sender.send(Outbound::Frame(frame.clone())).is_err() {
                return false;
            }
        }
        true
    }

    /// User-initiated teardown: close the transport with code 1000, stop
    /// the supervision task, scrub key material, release listeners.
    /// Idempotent.
    pub fn cleanup(&self) {
        if self.shared.intentional.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Cleaning up bridge session");
        let was_connected = self.shared.connected.load(Ordering::Acquire);
        if let Some(sender) = self.shared.sender.lock().expect("sender lock").take() {
            let _ = sender.send(Outbound::Close {
                code: CLOSE_CODE_USER,
                reason: CLOSE_REASON_USER.to_string(),
            });
        }
        self.shared.stop.cancel();
        self.shared.connected.store(false, Ordering::Release);
        self.shared.lock_session().cleanup();
        if was_connected {
            self.shared.listeners.emit(&BridgeEvent::Disconnected(Disconnection {
                code: CLOSE_CODE_USER,
                reason: CLOSE_REASON_USER.to_string(),
                was_connected: true,
                intentional: true,
                will_reconnect: false,
            }));
        }
        self.shared.listeners.clear();
    }
}

// ── Supervision loop ─────────────────────────────────────────────────────────

impl Shared {
    fn lock_session(&self) -> std::sync::MutexGuard<'_, SessionCoordinator> {
        self.coordinator.lock().expect("session lock")
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            if self.stop.cancelled() {
                return;
            }

            let request = match self.connect_request() {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Cannot build relay url");
                    self.listeners.emit(&BridgeEvent::FailedToConnect {
                        code: 0,
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            match self.connector.connect(request).await {
                Ok(connection) => {
                    let reconnection = ever_connected;
                    ever_connected = true;
                    attempt = 0;
                    self.connected.store(true, Ordering::Release);
                    *self.sender.lock().expect("sender lock") = Some(connection.sender.clone());

                    info!(reconnection, "Bridge connected");
                    if reconnection {
                        // Ask for missed frames before anything else; the
                        // seen-id guard filters whatever comes back.
                        match self.lock_session().replay_frame() {
                            Ok(Some(frame)) => {
                                debug!("Requesting replay of missed frames");
                                let _ = connection.sender.send(Outbound::Frame(frame));
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "Could not build replay request"),
                        }
                    }
                    self.listeners.emit(&BridgeEvent::Connected { reconnection });
                    if !reconnection && self.lock_session().context().is_resumed() {
                        // Resumption skips the handshake entirely.
                        self.listeners.emit(&BridgeEvent::SecureChannelEstablished);
                    }

                    let end = self.read_loop(connection).await;
                    self.connected.store(false, Ordering::Release);
                    *self.sender.lock().expect("sender lock") = None;

                    match end {
                        ReadEnd::Stopped => return,
                        ReadEnd::Closed {
                            code,
                            reason,
                            was_clean,
                        } => {
                            let intentional = self.intentional.load(Ordering::Acquire);
                            let will_reconnect = !intentional
                                && self.config.reconnect
                                && self.config.max_reconnect_attempts > 0
                                && !self.stop.cancelled();
                            warn!(code, reason = %reason, was_clean, will_reconnect, "Bridge disconnected");
                            self.listeners.emit(&BridgeEvent::Disconnected(Disconnection {
                                code,
                                reason,
                                was_connected: true,
                                intentional,
                                will_reconnect,
                            }));
                            if !will_reconnect {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    if !ever_connected {
                        // Never opened: this is a connect failure, not a drop.
                        warn!(error = %e, "Failed to connect to bridge");
                        self.listeners.emit(&BridgeEvent::FailedToConnect {
                            code: 1006,
                            reason: e.to_string(),
                        });
                        return;
                    }
                    debug!(error = %e, attempt, "Reconnect attempt failed");
                }
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                warn!(attempts = attempt - 1, "Reconnect budget exhausted, giving up");
                return;
            }
            let delay = backoff_delay(attempt, self.config.reconnect_base_delay);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.stop.wait() => return,
                }
            }
        }
    }

    /// Relay URL and origin header for the next attempt. The Joiner
    /// preloads its handshake via `moc` until the channel is established.
    fn connect_request(&self) -> Result<ConnectRequest, BridgeError> {
        let mut session = self.lock_session();
        let bridge_id = session.context().bridge_id().to_string();
        match session.context().role().clone() {
            Role::Creator { origin } => Ok(ConnectRequest {
                url: build_ws_url(&self.config.bridge_url, &bridge_id, None)?,
                origin: Some(origin),
            }),
            Role::Joiner { .. } => {
                let moc = if session.is_established() {
                    None
                } else {
                    Some(session.handshake_envelope()?)
                };
                Ok(ConnectRequest {
                    url: build_ws_url(&self.config.bridge_url, &bridge_id, moc.as_ref())?,
                    origin: Some(NODEJS_ORIGIN.to_string()),
                })
            }
        }
    }

    async fn read_loop(&self, mut connection: Connection) -> ReadEnd {
        let start = tokio::time::Instant::now() + self.config.ping_interval;
        let mut ping = tokio::time::interval_at(start, self.config.ping_interval);

        loop {
            tokio::select! {
                _ = self.stop.wait() => {
                    return ReadEnd::Stopped;
                }
                _ = ping.tick() => {
                    match self.lock_session().ping_frame() {
                        Ok(frame) => {
                            trace!("Sending keepalive ping");
                            let _ = connection.sender.send(Outbound::Frame(frame));
                        }
                        Err(e) => warn!(error = %e, "Could not build ping frame"),
                    }
                }
                event = connection.events.recv() => match event {
                    Some(ConnectionEvent::Frame(frame)) => {
                        // The session lock is held for the whole frame:
                        // routing, state transitions and reply encoding are
                        // one atomic step.
                        let outcome = self.lock_session().handle_frame(&frame, now_ms());
                        for action in outcome.actions {
                            let Action::SendFrame(reply) = action;
                            let _ = connection.sender.send(Outbound::Frame(reply));
                        }
                        for event in &outcome.events {
                            self.listeners.emit(event);
                        }
                    }
                    Some(ConnectionEvent::Closed { code, reason, was_clean }) => {
                        return ReadEnd::Closed { code, reason, was_clean };
                    }
                    None => {
                        return ReadEnd::Closed {
                            code: 1006,
                            reason: "transport channel closed".to_string(),
                            was_clean: false,
                        };
                    }
                }
            }
        }
    }
}

/// Backoff schedule: attempt 1 immediate, then `base * 2^(k-2)`.
fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let shift = (attempt - 2).min(16);
    base.saturating_mul(1u32 << shift)
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::MemoryRelay;
    use crate::core::events::EventKind;
    use crate::core::security::crypto::KeyPair;

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(1, base), Duration::ZERO);
        assert_eq!(backoff_delay(2, base), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, base), Duration::from_secs(2));
        assert_eq!(backoff_delay(4, base), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, base), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_failed_to_connect_before_first_open() {
        let relay = MemoryRelay::new();
        relay.refuse_next_connects(u32::MAX);

        let kp = KeyPair::generate();
        let bridge_id = kp.public_key_hex();
        let coordinator = SessionCoordinator::new(SessionContext::new(
            Role::Creator {
                origin: "https://localhost".into(),
            },
            kp,
            bridge_id,
        ));

        let listeners = EventListeners::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = listeners.subscribe(EventKind::FailedToConnect, move |event| {
            let _ = tx.send(event.clone());
        });

        let controller = ConnectionController::new(
            coordinator,
            listeners,
            Arc::new(relay.connector()),
            ControllerConfig {
                bridge_url: "wss://relay.test".into(),
                ..ControllerConfig::default()
            },
        );
        controller.start();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("FailedToConnect within deadline")
            .unwrap();
        assert!(matches!(event, BridgeEvent::FailedToConnect { .. }));
        assert!(!controller.is_connected());
    }
}
