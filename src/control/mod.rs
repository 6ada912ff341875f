//! Control API
//!
//! Exposes the port forward manager over a local JSON-over-WebSocket
//! endpoint: `ping`, `forwardUserServicePort`, `stopUserServicePortForward`
//! and `listPortForwards`.

mod client;
pub mod protocol;
mod server;

pub use client::PortalClient;
pub use protocol::{Call, Reply, Request, Response};
pub use server::{handle_call, ControlServer};
