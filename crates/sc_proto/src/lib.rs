//! sc_proto — Wire envelopes and padding for Secure Channel
//!
//! Envelopes are serialised to JSON and versioned so the format can change
//! without breaking older peers.
//!
//! # Modules
//! - `envelope` — encrypted message envelope (what a relay sees)
//! - `codec`    — length-prefixed bucket padding applied before encryption
//! - `error`    — `ProtoError`

pub mod codec;
pub mod envelope;
pub mod error;

pub use codec::PaddingMode;
pub use envelope::{Envelope, InitData, ENVELOPE_VERSION};
pub use error::ProtoError;
