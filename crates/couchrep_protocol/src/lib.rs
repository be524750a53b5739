//! # couchrep protocol
//!
//! Wire types for controlling CouchDB-style server-side replication.
//!
//! This crate provides:
//! - `ReplicationConfig` describing a pull or push replication
//! - Start and cancel bodies for `POST /_replicate`
//! - Parsing of start replies and `GET /_active_tasks` records
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod messages;

pub use config::{Direction, JsonObject, OAuthCredentials, ReplicationConfig};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    error_reason, parse_active_tasks, parse_processed, start_body, stop_body, ActiveTask,
    StartResponse, ACTIVE_TASKS_PATH, REPLICATE_PATH, STRUCTURAL_KEYS,
};
