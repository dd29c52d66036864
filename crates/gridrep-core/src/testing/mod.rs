//! Testing infrastructure for gridrep Core
//!
//! Helpers that start isolated nodes over an in-process replication log, so
//! cluster tests run in parallel without sharing state directories.
//!
//! # Usage
//!
//! ```rust,no_run
//! use gridrep_core::testing::{TestCluster, init_tracing};
//!
//! #[test]
//! fn my_test() -> gridrep_core::Result<()> {
//!     init_tracing();
//!     let cluster = TestCluster::new();
//!     let (node, storage) = cluster.start_node("node-a")?;
//!     node.activate_distribution()?;
//!     // TestCluster removes every state directory on drop
//!     Ok(())
//! }
//! ```

mod cluster;
mod context;

pub use cluster::{TestCluster, init_tracing, wait_for};
pub use context::TestContext;
