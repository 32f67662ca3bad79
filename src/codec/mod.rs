//! Carina - Message Codec
//!
//! Encodes outbound calls into JSON envelopes, optionally gzip-compressed, and
//! decodes inbound frames into typed messages:
//!
//! | Inbound `type` | Decoded as          | Routed to                    |
//! |----------------|---------------------|------------------------------|
//! | `event`        | [`ServerEvent`]     | public event stream          |
//! | `reply`        | [`Reply`]           | request correlator           |
//! | anything else  | `MessageParseError` | event stream, connection kept |

mod compression;
mod message;

pub use compression::*;
pub use message::*;
