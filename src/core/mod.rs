//! Carina - Core error types and constants.
//!
//! This module provides the protocol constants and the error taxonomy shared by
//! the codec, transport and client layers. It has no runtime dependencies.

mod constants;
mod error;

pub use constants::*;
pub use error::*;
