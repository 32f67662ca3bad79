//! Carina - Transport Layer
//!
//! This module defines what the connection state machine needs from a socket,
//! and the reconnection backoff it applies when that socket goes away:
//!
//! - **Transport seam**: [`Connector`], [`Transport`], [`TransportLink`], [`TransportEvent`]
//! - **Frames**: [`Frame`] (text or gzip-compressed binary)
//! - **Handshake**: [`Handshake`] (url, sub-protocol, headers)
//! - **Backoff**: [`ReconnectionPolicy`] and [`ExponentialReconnectionPolicy`]
//! - **In-process transport**: [`memory`]
//! - **WebSocket transport**: `WebSocketConnector` (feature `websocket`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Client (packets, correlation)      │
//! ├─────────────────────────────────────────┤
//! │     Codec (JSON envelopes, gzip)        │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   connector, frames, backoff            │
//! ├─────────────────────────────────────────┤
//! │     Message stream (WebSocket, ...)     │
//! └─────────────────────────────────────────┘
//! ```

mod error;
pub mod memory;
mod reconnect;
mod socket;
#[cfg(feature = "websocket")]
#[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
mod websocket;

pub use error::*;
pub use reconnect::{ExponentialReconnectionPolicy, ReconnectionPolicy};
pub use socket::*;
#[cfg(feature = "websocket")]
#[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
pub use websocket::WebSocketConnector;
