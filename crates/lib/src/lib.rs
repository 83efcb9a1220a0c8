//! VISS gateway library: the client-facing HTTP and WebSocket transports, the
//! session multiplexer over manager channels, and transport security.

pub mod codec;
pub mod compression;
pub mod config;
pub mod gateway;
pub mod hub;
pub mod routing;
pub mod session;
pub mod tls;
