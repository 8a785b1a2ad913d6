//! Local relay listener
//!
//! Accepts local clients on a fixed address and relays each one, byte for
//! byte, to the elected tunnel's loopback port.

mod server;

pub use server::{RelayConfig, RelayError, RelayServer, SessionIdGenerator};
