#![deny(unsafe_code)]

//! Port resolution and connection acceptance: turning a set of preferred
//! ports into actually-bindable ones, binding with the retry tolerance the
//! original deployment scripts relied on, and the single-port multiplex
//! negotiation that lets one listener serve several engines.

mod multiplex;
mod port;
mod serve;

pub use multiplex::{negotiate, Negotiated, NegotiationError};
pub use port::{find_available_port, resolve_engine_ports, resolve_single_port, ResolvedPort};
pub use serve::{bind_with_retry, serve};
