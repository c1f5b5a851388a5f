#![deny(unsafe_code)]

//! # Overview
//!
//! `bridge_core` holds the domain types shared across the chess UCI bridge
//! workspace: the engine [`descriptor::EngineDescriptor`] and
//! [`descriptor::EngineRegistry`], plus the small address/network helpers
//! used by the trust filter and listener set. Crates that need to agree on
//! "what an engine is" without agreeing on how it is spawned, throttled, or
//! reached depend on this crate alone.
//!
//! # Design
//!
//! Descriptors are immutable after construction; port resolution and
//! auto-discovery build a fresh set of descriptors rather than mutating one
//! in place (see [`descriptor::EngineRegistry::new`]).

/// Engine descriptors and the process-wide engine registry.
pub mod descriptor;
/// Auto-discovery of engine executables under a configured directory.
pub mod discover;
/// Address and CIDR-network helpers used by the trust filter.
pub mod net;

pub use descriptor::{DescriptorError, EngineDescriptor, EngineRegistry, OptionOverride, RegistryError};
pub use discover::{assign_ports, discover_engines, DiscoveredEngine};
