//! Pure encoding and decoding of everything that goes over a messenger socket. Nothing in here
//!  does I/O, and all decoders fail with an error on truncated or out-of-bounds input.
//!
//! Handshake, connecting side (C) and accepting side (A):
//! ```ascii
//! A -> C   BANNER | A's PeerAddr | C's PeerAddr as observed by A
//! C -> A   BANNER | C's PeerAddr | CONNECT | authorizer
//! A -> C   CONNECT-REPLY | authorizer reply [| A's in_seq (u64) if READY]
//! C -> A   C's in_seq (u64), only after READY
//! ```
//!
//! After that, frames of the form `tag (1) | payload` flow in both directions.

pub mod features;
pub mod frame;
pub mod handshake;
pub mod peer_addr;

pub const BANNER: &[u8] = b"msgr v1\n";
