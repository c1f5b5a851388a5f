#![deny(unsafe_code)]

//! Pairs one client socket with one engine session: authentication,
//! trust gating, the option-override rewrite, heartbeat/keepalive, and the
//! inactivity watchdog, for the lifetime of a single connection.

mod activity;
mod bridge;
mod context;
mod error;

pub use activity::ActivityClock;
pub use bridge::run_bridge;
pub use context::BridgeContext;
pub use error::BridgeError;
