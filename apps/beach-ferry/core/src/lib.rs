//! Primitives shared by the Beach Ferry relay and the peers talking to it.
//!
//! A ferry session pairs exactly one [`Role::Client`] with one
//! [`Role::Helper`] under a shared session token. Everything after the
//! opening [`Handshake`] is opaque to the relay.

pub mod channel;
pub mod close;
pub mod handshake;
pub mod role;

pub use channel::{session_fingerprint, ChannelPair};
pub use close::CloseReason;
pub use handshake::{parse_handshake, Handshake, HandshakeError};
pub use role::Role;
