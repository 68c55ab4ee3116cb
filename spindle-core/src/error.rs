//! Error types for Spindle
//!
//! This module defines the error types used throughout Spindle.

use thiserror::Error;

use crate::types::Key;

/// The main error type for Spindle operations
#[derive(Error, Debug)]
pub enum Error {
    /// A reserved sentinel key was passed to a queue operation
    #[error("key {0} is reserved for queue sentinels")]
    ReservedKey(Key),

    /// An invalid configuration was supplied
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A specialized Result type for Spindle operations
pub type Result<T> = std::result::Result<T, Error>;
