//! # edgeflow-id
//!
//! Typed identifiers used across the edgeflow scheduler.
//!
//! Every identifier is rendered as `{prefix}_{ulid}`:
//!
//! - `req_01HV4Z2WQXKJNM8GPQY6VBKC3D` for an invocation request
//! - `ctr_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a local execution container
//! - `node_01HV4Z4NYPLTRS0JTUA8XDME5F` for a scheduling node
//!
//! The prefix keeps request and container handles apart in logs.

mod error;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
