//! unembed Protocol
//!
//! Shared types for communication between the unembed engine, server and clients.
//! These types are serialized as JSON over HTTP.

pub mod types;

pub use types::*;
