//! # edgeflow-function
//!
//! The data model every edgeflow component agrees on.
//!
//! ## Overview
//!
//! - [`Function`]: registry metadata of a deployable function (name, memory
//!   and CPU demand, runtime).
//! - [`Request`]: one invocation of a function, carrying its QoS class, its
//!   offloading permission and a mutable [`ExecutionReport`] filled in by
//!   whoever executes it.
//! - [`Priority`] / [`RequestQoS`]: the QoS tier and its response-time target.
//! - [`Location`] / [`Decision`]: where a request ran and what the scheduler
//!   decided for it.
//! - [`InvocationRequest`] / [`InvocationResult`]: the payload exchanged with
//!   the execution transport.
//!
//! All durations are `f64` milliseconds.

mod error;
mod request;
mod types;

pub use error::FunctionError;
pub use request::*;
pub use types::*;
