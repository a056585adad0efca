//! HTTP and WebSocket surface for tapline checkouts.

pub mod api;
pub mod metrics;
pub mod state;
