//! # couchrep engine
//!
//! Client-side control of server-side CouchDB replications.
//!
//! This crate provides:
//! - [`ReplicationController`], which starts and stops one replication and
//!   tracks it through `Stopped`, `Offline`, `Idle` and `Active`
//! - Status reconciliation from `_active_tasks` snapshots
//! - Bookkeeping and cancellation of in-flight requests
//! - A request engine abstraction with an HTTP implementation
//!
//! ## Architecture
//!
//! The server does the copying. The controller only issues
//! `POST /_replicate` to start or cancel, and polls `GET /_active_tasks`
//! to learn what the server-side task is doing:
//! 1. `start()` submits the replication and records the task id
//! 2. Status polls are folded into the state by a reconciler
//! 3. `stop()` marks the replication stopped at once and asks the server
//!    to cancel it
//!
//! ## Key Invariants
//!
//! - `running` is true exactly when the mode is not `Stopped`
//! - `completed <= total`, and both are zero when stopped
//! - Parameters cannot change while running
//! - Replies to requests from an earlier run never touch the state
//! - Observers see each state change as one complete snapshot

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod config;
mod controller;
mod database;
mod error;
mod http;
mod reconcile;
mod state;
mod tracker;
mod transport;

pub use config::{ControllerConfig, RetryConfig};
pub use controller::{ReplicationController, StartOutcome};
pub use database::{LocalDatabase, NamedDatabase};
pub use error::{ErrorKind, ReplicationError, ReplicationResult};
pub use http::{HttpClient, HttpEngine, HttpFuture, HttpReply};
pub use reconcile::{Reconciler, TaskObservation};
pub use state::{ReplicationMode, ReplicationState};
pub use tracker::{CancelHandle, RequestId, RequestPurpose, RequestTracker, TrackedRequest};
pub use transport::{BoxFuture, Method, MockEngine, RequestEngine, RestRequest, RestResponse};

pub use couchrep_protocol::{
    ActiveTask, Direction, JsonObject, OAuthCredentials, ReplicationConfig, StartResponse,
};
