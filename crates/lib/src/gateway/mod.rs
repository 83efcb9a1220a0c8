//! Gateway: the client-facing HTTP and WebSocket listeners.
//!
//! Each listener forwards client requests to its own manager channel and
//! sends the routed responses back to the originating session.

mod http;
mod server;
mod ws;

pub use server::{run_gateway, run_gateway_with_codec, GatewayState};
