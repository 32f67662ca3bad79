//! # Carina
//!
//! A persistent, auto-reconnecting RPC client for the Constellation event
//! socket (`cnstl` protocol).
//!
//! One long-lived message socket carries both request/reply calls and
//! server-pushed events. Carina keeps it alive:
//!
//! - **Durability**: calls made while disconnected are queued and sent once the
//!   server says hello; calls in flight when the socket drops are sent again
//!   after reconnecting
//! - **Backoff**: reconnects follow a pluggable [`ReconnectionPolicy`](transport::ReconnectionPolicy)
//! - **Compression**: outbound frames are gzip-compressed above a threshold,
//!   inbound binary frames are always gunzipped
//! - **Cancellation**: every call can be cancelled; `close()` cancels them all
//!
//! ## Modules
//!
//! - [`core`]: Constants and error types
//! - [`codec`]: JSON envelopes and gzip framing
//! - [`transport`]: Transport seam, handshake, reconnection backoff, the
//!   WebSocket and in-memory connectors
//! - [`client`]: Client handle, packets, connection state machine
//!
//! ## Example Usage
//!
//! ```rust
//! use carina::prelude::*;
//! use carina::transport::memory;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (connector, mut accept) = memory::channel();
//! let config = CarinaClient::builder().connector(connector).build()?;
//!
//! let client = CarinaClient::new(config);
//! client.connect()?;
//!
//! // Play the server.
//! let mut server = accept.recv().await.unwrap();
//! server.hello()?;
//!
//! let call = tokio::spawn({
//!     let client = client.clone();
//!     async move { client.execute("ping", json!({})).await }
//! });
//! let request = server.recv_json().await.unwrap()?;
//! server.reply(request["id"].as_u64().unwrap(), json!("pong"))?;
//!
//! assert_eq!(call.await??, json!("pong"));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Constants and errors
pub mod core;

// Wire format
pub mod codec;

// Transport seam
pub mod transport;

// Client API
pub mod client;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{
        CarinaClient, CarinaClientBuilder, ClientConfig, ClientError, ClientEvent,
        ConnectionState, Credential, EventSubscription, Packet, PacketId, PacketState,
    };
    pub use crate::codec::{CompressionDecision, SizeThreshold};
    pub use crate::core::{ConfigError, MessageParseError, ServerError};
    pub use crate::transport::{
        Connector, ExponentialReconnectionPolicy, Frame, Handshake, ReconnectionPolicy, Transport,
        TransportEvent, TransportLink,
    };

    #[cfg(feature = "websocket")]
    pub use crate::transport::WebSocketConnector;
}

// Re-export commonly used items at crate root
pub use crate::client::{CarinaClient, ClientError, ClientEvent, ConnectionState, Packet};
pub use crate::core::{ConfigError, ServerError};
