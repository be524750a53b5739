//! Test fixtures for controller scenarios.
//!
//! Wires a [`ReplicationController`] to a [`SimulatedCouch`] with timings
//! short enough for tests running on a paused Tokio clock.

use crate::server::SimulatedCouch;
use couchrep_engine::{
    ControllerConfig, NamedDatabase, ReplicationConfig, ReplicationController, ReplicationState,
    RetryConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Remote URL used by the fixtures.
pub const REMOTE_URL: &str = "https://couch.example.com/remote";

/// Local database name used by the fixtures.
pub const LOCAL_DB: &str = "local";

/// How long [`next_state`] waits before giving up.
pub const STATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Controller settings for tests: one second polls, no jitter.
pub fn test_settings() -> ControllerConfig {
    ControllerConfig::new()
        .with_poll_interval(Duration::from_secs(1))
        .with_poll_backoff(RetryConfig::new().without_jitter())
        .with_request_timeout(Duration::from_secs(10))
}

/// A controller connected to a simulated server.
pub struct TestReplication {
    /// The simulated server.
    pub couch: Arc<SimulatedCouch>,
    /// The controller under test.
    pub controller: ReplicationController,
    /// Subscription opened before anything happened.
    pub updates: UnboundedReceiver<ReplicationState>,
}

impl TestReplication {
    /// Creates a replication with `config` and [`test_settings`].
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: ReplicationConfig) -> Self {
        Self::with_settings(config, test_settings())
    }

    /// Creates a replication with explicit controller settings.
    pub fn with_settings(config: ReplicationConfig, settings: ControllerConfig) -> Self {
        let couch = Arc::new(SimulatedCouch::new());
        let controller = ReplicationController::new(
            Arc::new(NamedDatabase::new(LOCAL_DB)),
            config,
            Arc::clone(&couch),
            settings,
        )
        .expect("controller needs a Tokio runtime");
        let updates = controller.subscribe();
        Self {
            couch,
            controller,
            updates,
        }
    }

    /// One-shot pull from [`REMOTE_URL`].
    pub fn pull() -> Self {
        Self::new(ReplicationConfig::pull(REMOTE_URL))
    }

    /// Continuous pull from [`REMOTE_URL`].
    pub fn continuous_pull() -> Self {
        Self::new(ReplicationConfig::pull(REMOTE_URL).continuous())
    }

    /// Continuous push to [`REMOTE_URL`].
    pub fn continuous_push() -> Self {
        Self::new(ReplicationConfig::push(REMOTE_URL).continuous())
    }

    /// Starts the replication and returns the server task id.
    pub async fn start(&self) -> String {
        self.controller.start().await.expect("start failed");
        self.controller
            .remote_task_id()
            .expect("started replication has a task id")
    }

    /// Waits for the next published state satisfying `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&ReplicationState) -> bool) -> ReplicationState {
        next_state(&mut self.updates, pred).await
    }

    /// Drains every snapshot published so far.
    pub fn drain(&mut self) -> Vec<ReplicationState> {
        let mut seen = Vec::new();
        while let Ok(state) = self.updates.try_recv() {
            seen.push(state);
        }
        seen
    }
}

/// Waits on `updates` for a state satisfying `pred`.
///
/// Panics after [`STATE_TIMEOUT`] of Tokio time or if the controller closes.
pub async fn next_state(
    updates: &mut UnboundedReceiver<ReplicationState>,
    pred: impl Fn(&ReplicationState) -> bool,
) -> ReplicationState {
    tokio::time::timeout(STATE_TIMEOUT, async {
        loop {
            let state = updates.recv().await.expect("controller closed");
            if pred(&state) {
                return state;
            }
        }
    })
    .await
    .expect("expected state was never published")
}

#[cfg(test)]
mod tests {
    use super::*;
    use couchrep_engine::ReplicationMode;

    #[tokio::test(start_paused = true)]
    async fn fixture_starts_against_simulation() {
        let mut replication = TestReplication::continuous_pull();
        let task_id = replication.start().await;
        assert!(replication.couch.task(&task_id).is_some());

        let state = replication.wait_for(|s| s.running).await;
        assert_eq!(state.mode, ReplicationMode::Active);
    }
}
