//! Tunnel server
//!
//! Pools live tunnel-client connections in a [`ConnectionRegistry`] and
//! forwards every inbound plaintext TCP connection through a fresh stream on
//! one of them, picked round robin.

pub mod registry;
pub mod server;

pub use registry::{ConnectionRegistry, RegistryError};
pub use server::{ServerError, TunnelServer};
