//! Error types for the function model.

use thiserror::Error;

/// Errors raised while parsing or validating function model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FunctionError {
    /// The QoS class name or code is not known.
    #[error("unknown QoS class: {0}")]
    UnknownClass(String),

    /// An execution location outside {local, cloud, edge} was reported.
    #[error("invalid execution location: {0}")]
    InvalidLocation(i64),
}
