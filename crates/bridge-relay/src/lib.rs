#![deny(unsafe_code)]

//! NAT traversal for engines that are not directly reachable: a relay
//! rendezvous server pairs two legs of a TCP connection by a shared session
//! id, and a dialer lets a bridge register its `server` leg against one and
//! wait for a client to show up.
//!
//! # Overview
//! [`session_id::derive_session_id`] turns the bridge's persistent secret
//! and an engine name into a session id both sides can compute
//! independently. [`client::RelayDialer`] is the bridge-side half: it
//! registers, waits, and hands the paired stream to a caller-supplied
//! handler, reconnecting forever. [`server::run`] is the rendezvous
//! half: matching `server`/`client` registrations for the same id and
//! splicing their bytes together.

mod client;
mod error;
mod server;
mod session_id;

pub use client::RelayDialer;
pub use error::RelayError;
pub use server::{run as run_rendezvous_server, RelayRegistry};
pub use session_id::{derive_session_id, MULTIPLEX_SESSION_LABEL};
