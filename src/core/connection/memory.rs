//! In-memory relay: the untrusted rendezvous server, in-process.
//!
//! Implements just enough of the externally-defined relay contract to
//! drive full Creator↔relay↔Joiner flows without sockets: topic routing
//! by the `id` query parameter, `moc` auto-broadcast on connect, origin
//! stamping of every forwarded envelope, a replay buffer served on
//! `replay` requests, and forced disconnects for reconnection tests.
//!
//! Exported so embedders can test against the same collaborator the
//! crate's own tests use. It is not a production relay.

use crate::core::config::NODEJS_ORIGIN;
use crate::core::connection::{
    ConnectRequest, Connection, ConnectionEvent, Connector, Outbound,
};
use crate::core::error::BridgeError;
use crate::core::protocol::envelope::METHOD_REPLAY;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

// ── Relay state ──────────────────────────────────────────────────────────────

struct RelayClient {
    id: u64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

#[derive(Default)]
struct Topic {
    clients: Vec<RelayClient>,
    /// Forwarded frames (origin already stamped) with arrival times,
    /// served back on `replay` requests.
    history: Vec<(u64, String)>,
}

#[derive(Default)]
struct RelayState {
    topics: HashMap<String, Topic>,
    next_client_id: u64,
    refuse_connects: u32,
}

/// Shared in-process relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that dials this relay.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            state: Arc::clone(&self.state),
        }
    }

    /// Make the next `n` connection attempts fail (transport error).
    pub fn refuse_next_connects(&self, n: u32) {
        self.state.lock().expect("relay lock").refuse_connects = n;
    }

    /// Forcibly drop every client of a topic, as an unclean close.
    pub fn disconnect_topic(&self, bridge_id: &str) {
        let mut state = self.state.lock().expect("relay lock");
        if let Some(topic) = state.topics.get_mut(bridge_id) {
            for client in topic.clients.drain(..) {
                let _ = client.events.send(ConnectionEvent::Closed {
                    code: 1006,
                    reason: "connection reset".into(),
                    was_clean: false,
                });
            }
        }
    }

    /// Re-deliver the most recent buffered frame to every client of a
    /// topic, verbatim — the duplicate-delivery case peers must tolerate.
    pub fn replay_last(&self, bridge_id: &str) {
        let state = self.state.lock().expect("relay lock");
        if let Some(topic) = state.topics.get(bridge_id) {
            if let Some((_, frame)) = topic.history.last() {
                for client in &topic.clients {
                    let _ = client.events.send(ConnectionEvent::Frame(frame.clone()));
                }
            }
        }
    }

    /// Number of currently connected clients on a topic.
    pub fn client_count(&self, bridge_id: &str) -> usize {
        self.state
            .lock()
            .expect("relay lock")
            .topics
            .get(bridge_id)
            .map(|topic| topic.clients.len())
            .unwrap_or(0)
    }
}

// ── Routing ──────────────────────────────────────────────────────────────────

/// Stamp the sender's declared origin into a JSON frame and fan it out to
/// every other client of the topic. Non-`nocache` frames enter the replay
/// buffer.
fn broadcast(state: &mut RelayState, topic_id: &str, sender_id: u64, origin: &str, frame: &str) {
    let (stamped, cacheable) = match serde_json::from_str::<Value>(frame) {
        Ok(Value::Object(mut map)) => {
            map.insert("origin".to_string(), Value::String(origin.to_string()));
            let cacheable = map.get("nocache").and_then(Value::as_bool) != Some(true);
            (Value::Object(map).to_string(), cacheable)
        }
        // Not a JSON object: forward untouched, never buffer.
        _ => (frame.to_string(), false),
    };

    let Some(topic) = state.topics.get_mut(topic_id) else {
        return;
    };
    if cacheable {
        topic.history.push((now_ms(), stamped.clone()));
    }
    for client in &topic.clients {
        if client.id != sender_id {
            trace!(topic_id, to = client.id, "Relay forwarding frame");
            let _ = client.events.send(ConnectionEvent::Frame(stamped.clone()));
        }
    }
}

/// Serve a `replay` request: resend buffered frames at or after the
/// requested timestamp to the requesting client only.
fn serve_replay(state: &mut RelayState, topic_id: &str, client_id: u64, frame: &str) {
    let since = serde_json::from_str::<Value>(frame)
        .ok()
        .and_then(|value| value["params"]["timestamp"].as_u64())
        .unwrap_or(0);

    let Some(topic) = state.topics.get(topic_id) else {
        return;
    };
    let Some(client) = topic.clients.iter().find(|c| c.id == client_id) else {
        return;
    };
    let mut resent = 0usize;
    for (timestamp, frame) in &topic.history {
        if *timestamp >= since {
            let _ = client.events.send(ConnectionEvent::Frame(frame.clone()));
            resent += 1;
        }
    }
    debug!(topic_id, client_id, since, resent, "Relay served replay request");
}

fn remove_client(state: &mut RelayState, topic_id: &str, client_id: u64) {
    if let Some(topic) = state.topics.get_mut(topic_id) {
        topic.clients.retain(|client| client.id != client_id);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

// ── Connector ────────────────────────────────────────────────────────────────

/// [`Connector`] that dials a [`MemoryRelay`].
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<RelayState>>,
}

impl Connector for MemoryConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, BridgeError>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let url = Url::parse(&request.url)
                .map_err(|e| BridgeError::transport(format!("invalid relay url: {e}")))?;
            let topic_id = url
                .query_pairs()
                .find(|(key, _)| key == "id")
                .map(|(_, value)| value.into_owned())
                .ok_or_else(|| BridgeError::transport("relay url missing id parameter"))?;
            let moc = url
                .query_pairs()
                .find(|(key, _)| key == "moc")
                .map(|(_, value)| value.into_owned());

            let origin = request.origin.unwrap_or_else(|| NODEJS_ORIGIN.to_string());
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
            let (event_tx, event_rx) = mpsc::unbounded_channel::<ConnectionEvent>();

            let client_id = {
                let mut guard = state.lock().expect("relay lock");
                if guard.refuse_connects > 0 {
                    guard.refuse_connects -= 1;
                    return Err(BridgeError::transport("relay refused connection"));
                }
                guard.next_client_id += 1;
                let client_id = guard.next_client_id;
                guard.topics.entry(topic_id.clone()).or_default().clients.push(RelayClient {
                    id: client_id,
                    events: event_tx,
                });

                // Message-on-connect: broadcast the preloaded handshake
                // on behalf of the connecting client.
                if let Some(moc) = moc {
                    if let Ok(bytes) = BASE64.decode(moc.as_bytes()) {
                        if let Ok(frame) = String::from_utf8(bytes) {
                            broadcast(&mut guard, &topic_id, client_id, &origin, &frame);
                        }
                    }
                }
                client_id
            };
            debug!(%topic_id, client_id, %origin, "Relay client connected");

            // Pump: frames from this client into the topic.
            tokio::spawn(async move {
                loop {
                    match outbound_rx.recv().await {
                        Some(Outbound::Frame(frame)) => {
                            let mut guard = state.lock().expect("relay lock");
                            let is_replay = serde_json::from_str::<Value>(&frame)
                                .ok()
                                .and_then(|v| v["method"].as_str().map(|m| m == METHOD_REPLAY))
                                .unwrap_or(false);
                            if is_replay {
                                serve_replay(&mut guard, &topic_id, client_id, &frame);
                            } else {
                                broadcast(&mut guard, &topic_id, client_id, &origin, &frame);
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            let mut guard = state.lock().expect("relay lock");
                            if let Some(topic) = guard.topics.get_mut(&topic_id) {
                                if let Some(client) =
                                    topic.clients.iter().find(|c| c.id == client_id)
                                {
                                    let _ = client.events.send(ConnectionEvent::Closed {
                                        code,
                                        reason,
                                        was_clean: true,
                                    });
                                }
                            }
                            remove_client(&mut guard, &topic_id, client_id);
                            return;
                        }
                        None => {
                            let mut guard = state.lock().expect("relay lock");
                            remove_client(&mut guard, &topic_id, client_id);
                            return;
                        }
                    }
                }
            });

            Ok(Connection {
                sender: outbound_tx,
                events: event_rx,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::uri::build_ws_url;
    use crate::core::protocol::envelope::Envelope;

    async fn dial(relay: &MemoryRelay, topic: &str, origin: &str) -> Connection {
        let url = build_ws_url("wss://relay.test", topic, None).unwrap();
        relay
            .connector()
            .connect(ConnectRequest {
                url,
                origin: Some(origin.to_string()),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_frames_routed_to_peer_with_origin_stamped() {
        let relay = MemoryRelay::new();
        let a = dial(&relay, "t1", "https://a.example").await;
        let mut b = dial(&relay, "t1", "https://b.example").await;

        let frame = Envelope::new("ping", serde_json::json!({})).to_frame().unwrap();
        a.sender.send(Outbound::Frame(frame)).unwrap();

        match b.events.recv().await.unwrap() {
            ConnectionEvent::Frame(received) => {
                let envelope = Envelope::parse(&received).unwrap();
                assert_eq!(envelope.origin.as_deref(), Some("https://a.example"));
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sender_does_not_hear_own_frame() {
        let relay = MemoryRelay::new();
        let mut a = dial(&relay, "t1", "https://a.example").await;
        let _b = dial(&relay, "t1", "https://b.example").await;

        let frame = Envelope::new("ping", serde_json::json!({})).to_frame().unwrap();
        a.sender.send(Outbound::Frame(frame)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_moc_broadcast_on_connect() {
        let relay = MemoryRelay::new();
        let mut creator = dial(&relay, "t1", "https://a.example").await;

        let handshake = Envelope::new("handshake", serde_json::json!({"pubkey": "02ab"}));
        let url = build_ws_url("wss://relay.test", "t1", Some(&handshake)).unwrap();
        let _joiner = relay
            .connector()
            .connect(ConnectRequest { url, origin: None })
            .await
            .unwrap();

        match creator.events.recv().await.unwrap() {
            ConnectionEvent::Frame(frame) => {
                let envelope = Envelope::parse(&frame).unwrap();
                assert_eq!(envelope.method, "handshake");
                assert_eq!(envelope.origin.as_deref(), Some(NODEJS_ORIGIN));
            }
            other => panic!("expected handshake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_topic_closes_unclean() {
        let relay = MemoryRelay::new();
        let mut a = dial(&relay, "t1", "https://a.example").await;
        assert_eq!(relay.client_count("t1"), 1);

        relay.disconnect_topic("t1");
        match a.events.recv().await.unwrap() {
            ConnectionEvent::Closed { code, was_clean, .. } => {
                assert_eq!(code, 1006);
                assert!(!was_clean);
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(relay.client_count("t1"), 0);
    }

    #[tokio::test]
    async fn test_replay_serves_buffered_frames() {
        let relay = MemoryRelay::new();
        let a = dial(&relay, "t1", "https://a.example").await;
        let mut b = dial(&relay, "t1", "https://b.example").await;

        let frame = Envelope::new("data", serde_json::json!({"x": 1})).to_frame().unwrap();
        a.sender.send(Outbound::Frame(frame)).unwrap();
        let ConnectionEvent::Frame(first) = b.events.recv().await.unwrap() else {
            panic!("expected frame");
        };

        let replay = Envelope::new(METHOD_REPLAY, serde_json::json!({"timestamp": 0}))
            .to_frame()
            .unwrap();
        b.sender.send(Outbound::Frame(replay)).unwrap();
        let ConnectionEvent::Frame(resent) = b.events.recv().await.unwrap() else {
            panic!("expected replayed frame");
        };
        assert_eq!(first, resent, "replay must resend the frame verbatim");
    }

    #[tokio::test]
    async fn test_refuse_next_connects() {
        let relay = MemoryRelay::new();
        relay.refuse_next_connects(1);

        let url = build_ws_url("wss://relay.test", "t1", None).unwrap();
        let result = relay
            .connector()
            .connect(ConnectRequest {
                url: url.clone(),
                origin: None,
            })
            .await;
        assert!(result.is_err());

        let result = relay
            .connector()
            .connect(ConnectRequest { url, origin: None })
            .await;
        assert!(result.is_ok(), "refusal budget must be consumed");
    }
}
