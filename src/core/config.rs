//! Centralized configuration constants for the bridge.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (JSON-RPC method names, key
//! sizes) stay in their respective modules.

use std::time::Duration;

// ── Relay ────────────────────────────────────────────────────────────────────

/// Default relay endpoint used when the caller does not supply one.
pub const DEFAULT_BRIDGE_URL: &str = "wss://bridge.zkpassport.id";

/// Origin token sent in the WebSocket upgrade when the client has no web
/// origin of its own (Joiner side, non-browser).
pub const NODEJS_ORIGIN: &str = "nodejs";

// ── Messaging / Chunking ─────────────────────────────────────────────────────

/// Maximum serialized size of one outer envelope (bytes of JSON).
///
/// The relay rejects frames above this size; exceeding it is a send-time
/// error, never a silent truncation.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;

/// Bytes of base64 payload carried by each inner chunk (16 KB).
///
/// Sized so that one chunk, once encrypted and wrapped in its outer
/// envelope, stays comfortably below [`MAX_PAYLOAD_SIZE`].
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Pacing interval between consecutive chunks of one message.
/// Keeps a burst of chunks from overloading the relay.
pub const CHUNK_WAIT: Duration = Duration::from_millis(50);

/// Payload size above which compression always pays for itself.
///
/// The encoder compresses every non-empty payload regardless; the constant
/// names the decoder contract, which must accept both compressed and
/// uncompressed single-part payloads.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Incomplete chunk groups older than this are evicted.
pub const CHUNK_BUFFER_TTL: Duration = Duration::from_secs(5 * 60);

// ── Liveness ─────────────────────────────────────────────────────────────────

/// Interval between keepalive pings while connected.
/// No response timeout is enforced; transport closure is the failure signal.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

// ── Reconnection ─────────────────────────────────────────────────────────────

/// Maximum reconnect attempts after a connection drop.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Base delay of the exponential backoff schedule.
/// Attempt 1 is immediate; attempt k >= 2 waits `base * 2^(k-2)`.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// How far behind `last_message_timestamp` the replay request reaches,
/// covering frames that raced the disconnect.
pub const REPLAY_LOOKBACK: Duration = Duration::from_secs(1);

// ── Close codes ──────────────────────────────────────────────────────────────

/// WebSocket close code for a user-initiated shutdown.
pub const CLOSE_CODE_USER: u16 = 1000;

/// Close reason accompanying [`CLOSE_CODE_USER`].
pub const CLOSE_REASON_USER: &str = "Connection closed by user";
