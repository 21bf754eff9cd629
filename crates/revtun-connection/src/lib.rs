//! Session plumbing shared by the tunnel server and clients
//!
//! - [`pipe`]: full-duplex byte copy between two endpoints with synchronized teardown
//! - [`reconnect`]: exponential backoff with jitter for the clients' dial loop

pub mod pipe;
pub mod reconnect;

pub use pipe::{pipe, PipeStats};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
