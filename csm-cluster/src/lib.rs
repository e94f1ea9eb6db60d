// csm-cluster - Cluster-core interface and the in-process loopback core
//
// The session layer talks to a cluster only through the traits in `core`;
// `loopback` implements them on top of an in-memory document store.

pub mod completion;
pub mod core;
pub mod io;
pub mod loopback;
mod management;
pub mod request;
pub mod store;
pub mod txn;

// Re-export for convenience
pub use crate::completion::{Completion, Delivery};
pub use crate::core::*;
pub use crate::io::RuntimeIoContext;
pub use crate::loopback::{CoreStats, ForkComponent, ForkRecord, LoopbackCluster, LoopbackCore};
pub use crate::request::*;
pub use crate::store::DocumentStore;
pub use crate::txn::{LoopbackTransactionContext, LoopbackTransactions};
