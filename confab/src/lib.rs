//! Confab signaling server
//!
//! Wires the [`confab_sfu`] core to the outside world: configuration,
//! structured logging, the per-connection signaling session and the
//! HTTP/WebSocket surface.

pub mod config;
pub mod http;
pub mod logging;
pub mod session;
