//! Core types for Spindle
//!
//! This crate contains the fundamental types and error handling used throughout
//! the Spindle project. It provides:
//!
//! - Common error types with [`Error`] and [`Result`]
//! - Basic data types like [`Key`] and [`Value`] and the reserved sentinel
//!   keys [`KEY_MIN`] and [`KEY_MAX`]
//!
//! # Example
//!
//! ```
//! use spindle_core::{Key, Value, KEY_MAX};
//!
//! let key: Key = 42;
//! let value: Value = 7;
//! assert!(key < KEY_MAX);
//! ```

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
