//! Core domain types for Kiln.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Both the protocol server core and the binary depend on it.

mod ids;

pub use ids::{ClientId, InvalidClientId, RequestId};
