//! # couchrep testkit
//!
//! Test utilities for couchrep.
//!
//! This crate provides:
//! - [`SimulatedCouch`], an in-process CouchDB replicator
//! - Fixtures wiring a controller to the simulation
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use couchrep_testkit::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn finishes() {
//!     let mut replication = TestReplication::pull();
//!     let task_id = replication.start().await;
//!     replication.couch.drop_task(&task_id);
//!     replication.wait_for(|s| !s.running).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
}

pub use fixtures::*;
pub use generators::*;
pub use server::*;
