//! Protocol constants and configuration defaults.
//!
//! Sub-protocol identifiers and message discriminators are fixed by the
//! Constellation wire protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Sub-protocol advertised when outbound frames may be gzip-compressed.
pub const PROTOCOL_GZIP: &str = "cnstl-gzip";

/// Sub-protocol advertised when compression is disabled.
pub const PROTOCOL_PLAIN: &str = "cnstl";

/// Default Constellation endpoint.
pub const DEFAULT_URL: &str = "wss://constellation.mixer.com";

/// Default user agent sent with every handshake.
pub const DEFAULT_USER_AGENT: &str = concat!("carina-rs/", env!("CARGO_PKG_VERSION"));

/// Header carrying the user agent.
pub const HEADER_USER_AGENT: &str = "User-Agent";

/// Header identifying automated clients.
pub const HEADER_IS_BOT: &str = "X-Is-Bot";

/// Header carrying the OAuth bearer credential.
pub const HEADER_AUTHORIZATION: &str = "Authorization";

/// Query parameter carrying the signed JWT credential.
pub const JWT_QUERY_PARAM: &str = "jwt";

// =============================================================================
// MESSAGES
// =============================================================================

/// Discriminator of outbound call envelopes.
pub const MESSAGE_TYPE_METHOD: &str = "method";

/// Event name the server sends once the socket is ready for traffic.
pub const HELLO_EVENT: &str = "hello";

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default time to wait for a reply once a call has been transmitted.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Encoded payloads longer than this are gzip-compressed by default.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Gzip level for outbound frames (0 stores, 9 is smallest).
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Upper bound on a decompressed inbound frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of the public event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// First reconnect delay of the default backoff.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling of the default backoff.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(20);

/// Growth factor of the default backoff.
pub const DEFAULT_RECONNECT_FACTOR: f64 = 2.0;

/// Jitter blend of the default backoff (0.0 = none, 1.0 = full).
pub const DEFAULT_RECONNECT_JITTER: f64 = 0.1;

/// Smallest delay a reconnection policy may yield.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(1);
