//! Carina - Client Library
//!
//! High-level API: configuration, packets, request correlation and the
//! connection state machine behind [`CarinaClient`].

#[allow(clippy::module_inception)]
mod client;
mod config;
mod connection;
mod correlator;
mod packet;

pub use client::*;
pub use config::*;
pub use connection::{ClientEvent, ConnectionState};
pub use correlator::RequestCorrelator;
pub use packet::*;
