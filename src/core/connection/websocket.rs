//! Production WebSocket transport over tokio-tungstenite.
//!
//! One connected socket becomes two pump tasks: a writer draining the
//! outbound channel into the sink, and a reader forwarding text frames
//! and the final close into the event channel. Non-browser environments
//! send an `Origin` header in the upgrade request; the relay uses it for
//! origin stamping.

use crate::core::connection::{
    ConnectRequest, Connection, ConnectionEvent, Connector, Outbound,
};
use crate::core::error::BridgeError;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Close code reported when the socket drops without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;

/// [`Connector`] backed by a real WebSocket client.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, BridgeError>> {
        Box::pin(async move {
            let mut upgrade = request
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| BridgeError::transport(format!("invalid relay url: {e}")))?;
            if let Some(origin) = &request.origin {
                let value = HeaderValue::from_str(origin)
                    .map_err(|e| BridgeError::transport(format!("invalid origin header: {e}")))?;
                upgrade.headers_mut().insert(ORIGIN, value);
            }

            let (socket, _response) = connect_async(upgrade)
                .await
                .map_err(|e| BridgeError::transport(format!("websocket open failed: {e}")))?;
            debug!(url = %request.url, "WebSocket connected");

            let (mut sink, mut stream) = socket.split();
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
            let (event_tx, event_rx) = mpsc::unbounded_channel::<ConnectionEvent>();

            // Writer: drain the outbound channel into the sink. A close
            // request or a send failure ends the task; the reader observes
            // the resulting closure.
            tokio::spawn(async move {
                while let Some(outbound) = outbound_rx.recv().await {
                    let result = match outbound {
                        Outbound::Frame(text) => sink.send(Message::Text(text)).await,
                        Outbound::Close { code, reason } => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            };
                            let _ = sink.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "WebSocket send failed");
                        break;
                    }
                }
            });

            // Reader: text frames in, exactly one Closed out.
            tokio::spawn(async move {
                loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if event_tx.send(ConnectionEvent::Frame(text)).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = match frame {
                                Some(frame) => (frame.code.into(), frame.reason.into_owned()),
                                None => (ABNORMAL_CLOSE, String::new()),
                            };
                            let _ = event_tx.send(ConnectionEvent::Closed {
                                code,
                                reason,
                                was_clean: true,
                            });
                            return;
                        }
                        // Transport-level ping/pong and binary frames are
                        // not part of the protocol.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = event_tx.send(ConnectionEvent::Closed {
                                code: ABNORMAL_CLOSE,
                                reason: e.to_string(),
                                was_clean: false,
                            });
                            return;
                        }
                        None => {
                            let _ = event_tx.send(ConnectionEvent::Closed {
                                code: ABNORMAL_CLOSE,
                                reason: "connection reset".to_string(),
                                was_clean: false,
                            });
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
