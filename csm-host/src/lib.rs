// csm-host - Embedding-host surface for the cluster session manager
//
// Validates host arguments, owns the per-process cache service and a table
// of request-scoped handles, and renders failures as host exceptions.

pub mod api;
pub mod logging;
pub mod options;
pub mod runtime;
pub mod settings;

// Re-export for convenience
pub use crate::options::{Args, OptionBag, OptionError};
pub use crate::runtime::{Handle, HostRuntime, Resource, ResourceTable};
pub use crate::settings::HostSettings;
