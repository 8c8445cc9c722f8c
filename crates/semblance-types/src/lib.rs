//! # semblance-types
//!
//! The action envelope protocol exchanged between the isolated core process and
//! the gateway, the only component allowed to touch the network.
//!
//! - [`ActionRequest`]: signed request envelope produced by the core
//! - [`ActionResponse`]: response envelope returned by the gateway
//! - [`ActionType`]: closed set of actions the gateway knows how to gate
//! - [`ErrorCode`]: machine-readable rejection and failure codes
//! - [`canonical`]: deterministic JSON canonicalization used for signing and
//!   hashing

pub mod action;
pub mod canonical;
pub mod envelope;
pub mod error;

pub use action::ActionType;
pub use canonical::{canonical_bytes, canonicalize};
pub use envelope::{
    now_rfc3339, ActionError, ActionRequest, ActionResponse, ActionStatus, ErrorCode,
};
pub use error::EnvelopeError;
