// csm-common - Error taxonomy and shared value types for the cluster session manager
//
// This crate defines the error codes, structured error contexts and the
// mapping onto host exception classes.

pub mod context;
pub mod error;
pub mod exception;
pub mod types;

// Re-export for convenience
pub use context::*;
pub use error::*;
pub use exception::*;
pub use types::*;
