//! Property-based test generators using proptest.
//!
//! Strategies for task records, observation sequences and replication
//! configurations.

use couchrep_engine::{ReplicationError, TaskObservation};
use couchrep_protocol::{ActiveTask, ReplicationConfig};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for valid remote database URLs.
pub fn remote_url_strategy() -> impl Strategy<Value = String> {
    (
        prop_oneof![Just("http"), Just("https")],
        prop::string::string_regex("[a-z][a-z0-9]{0,11}").expect("Invalid regex"),
        prop::option::of(1024u16..65535),
        prop::string::string_regex("[a-z][a-z0-9_$()+-]{0,15}").expect("Invalid regex"),
    )
        .prop_map(|(scheme, host, port, db)| match port {
            Some(port) => format!("{scheme}://{host}.example.com:{port}/{db}"),
            None => format!("{scheme}://{host}.example.com/{db}"),
        })
}

/// Strategy for valid replication configurations.
pub fn replication_config_strategy() -> impl Strategy<Value = ReplicationConfig> {
    (
        remote_url_strategy(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        prop::option::of(
            prop::string::string_regex("[a-z]{1,8}/[a-z]{1,8}").expect("Invalid regex"),
        ),
    )
        .prop_map(|(url, pull, continuous, create_target, filter)| {
            let mut config = if pull {
                ReplicationConfig::pull(url)
            } else {
                ReplicationConfig::push(url)
            };
            if continuous {
                config = config.continuous();
            }
            config = config.with_create_target(create_target);
            if let Some(filter) = filter {
                config = config.with_filter(filter);
            }
            config
        })
}

/// Strategy for `_active_tasks` records describing `task_id`.
///
/// Counters may be missing, negative or inconsistent, as servers send them.
pub fn task_record_strategy(task_id: String) -> impl Strategy<Value = Value> {
    (
        prop::option::of(-5i64..200),
        prop::option::of(-5i64..200),
        prop_oneof![
            3 => Just(None),
            1 => Just(Some("Idle".to_string())),
            1 => Just(Some("Offline".to_string())),
            2 => (0i64..200, 0i64..200)
                .prop_map(|(c, t)| Some(format!("Processed {c} / {t} changes"))),
        ],
        prop::option::of(0i64..5),
        prop::option::of(Just("unauthorized")),
    )
        .prop_map(move |(completed, total, status, pending, error)| {
            let mut record = json!({ "type": "replication", "replication_id": task_id });
            if let Some(completed) = completed {
                record["completed"] = json!(completed);
            }
            if let Some(total) = total {
                record["total"] = json!(total);
            }
            if let Some(status) = status {
                record["status"] = json!(status);
            }
            if let Some(pending) = pending {
                record["changes_pending"] = json!(pending);
            }
            if let Some(error) = error {
                record["error"] = json!(error);
            }
            record
        })
}

/// Strategy for one observation of `task_id`.
pub fn observation_strategy(task_id: String) -> impl Strategy<Value = TaskObservation> {
    prop_oneof![
        6 => task_record_strategy(task_id).prop_map(|record| {
            ActiveTask::from_json(&record)
                .map(TaskObservation::Found)
                .unwrap_or(TaskObservation::Malformed)
        }),
        1 => Just(TaskObservation::Missing),
        1 => Just(TaskObservation::Malformed),
        1 => Just(TaskObservation::FetchFailed(ReplicationError::transport_retryable(
            "connection reset"
        ))),
    ]
}

/// Strategy for a sequence of observations, each tagged with a sequence
/// number that may arrive out of order.
pub fn observation_sequence_strategy(
    task_id: &str,
    min_len: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<(u64, TaskObservation)>> {
    prop::collection::vec(
        (1u64..64, observation_strategy(task_id.to_string())),
        min_len..max_len,
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
