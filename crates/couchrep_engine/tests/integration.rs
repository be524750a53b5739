//! Integration tests for the replication controller against a simulated
//! CouchDB server.

use couchrep_engine::{
    ErrorKind, Method, OAuthCredentials, ReplicationConfig, ReplicationError, ReplicationMode,
    RequestPurpose, StartOutcome,
};
use couchrep_protocol::{ACTIVE_TASKS_PATH, REPLICATE_PATH};
use couchrep_testkit::{test_settings, TestReplication, LOCAL_DB, REMOTE_URL};
use serde_json::json;
use std::time::Duration;

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn one_shot_pull_runs_to_completion() {
    let mut r = TestReplication::pull();
    let task_id = r.start().await;
    assert_eq!(r.controller.mode(), ReplicationMode::Active);

    r.couch.set_progress(&task_id, 5, 10);
    let state = r.wait_for(|s| s.completed == 5).await;
    assert_eq!(state.mode, ReplicationMode::Active);
    assert_eq!(state.total, 10);
    assert_eq!(state.status_text, "Processed 5 / 10 changes");

    r.couch.set_progress(&task_id, 10, 10);
    r.wait_for(|s| s.completed == 10).await;

    r.couch.drop_task(&task_id);
    let state = r.wait_for(|s| !s.running).await;
    assert_eq!(state.mode, ReplicationMode::Stopped);
    assert!(!state.manually_stopped);
    assert!(state.last_error.is_none());
    assert_eq!(state.remote_task_id.as_deref(), Some(task_id.as_str()));
    assert_eq!((state.completed, state.total), (0, 0));
    assert!(r.controller.current_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn start_body_describes_endpoints() {
    let r = TestReplication::pull();
    let task_id = r.start().await;

    let task = r.couch.task(&task_id).unwrap();
    assert_eq!(task.source, REMOTE_URL);
    assert_eq!(task.target, LOCAL_DB);
    assert!(!task.continuous);

    let start = &r.couch.requests()[0];
    assert_eq!(start.method, Method::Post);
    assert_eq!(start.path, REPLICATE_PATH);
}

#[tokio::test(start_paused = true)]
async fn stop_discards_poll_in_flight() {
    let mut r = TestReplication::continuous_pull();
    r.couch.set_latency(Duration::from_millis(500));
    let task_id = r.start().await;
    r.couch.set_progress(&task_id, 5, 10);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(r
        .controller
        .current_requests()
        .iter()
        .any(|req| req.purpose == RequestPurpose::StatusPoll));

    r.controller.stop().await.unwrap();
    assert_eq!(r.controller.mode(), ReplicationMode::Stopped);
    assert!(r.controller.was_manually_stopped());

    advance(5).await;
    let seen = r.drain();
    assert!(!seen.iter().any(|s| s.completed == 5));
    let last = seen.last().unwrap();
    assert_eq!(last.mode, ReplicationMode::Stopped);
    assert!(last.manually_stopped);
    assert!(r.controller.current_requests().is_empty());
    assert_eq!(r.couch.cancel_count(), 1);
    assert!(r.couch.task(&task_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn stop_is_observable_before_acknowledgement() {
    let mut r = TestReplication::continuous_push();
    r.start().await;
    r.couch.set_latency(Duration::from_secs(5));

    let controller = r.controller.clone();
    let stopping = tokio::spawn(async move { controller.stop().await });
    let state = r.wait_for(|s| !s.running).await;
    assert!(state.manually_stopped);
    assert!(!stopping.is_finished());
    assert!(r
        .controller
        .current_requests()
        .iter()
        .any(|req| req.purpose == RequestPurpose::Stop));

    stopping.await.unwrap().unwrap();
    assert!(r.controller.current_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn server_rejection_leaves_replication_stopped() {
    let r = TestReplication::pull();
    r.couch.reject_next_start(500, "boom");

    let err = r.controller.start().await.unwrap_err();
    assert!(matches!(err, ReplicationError::ServerRejected { status: 500, .. }));
    assert_eq!(err.kind(), ErrorKind::ServerRejected);

    let state = r.controller.state();
    assert_eq!(state.mode, ReplicationMode::Stopped);
    assert!(state.remote_task_id.is_none());
    assert!(!state.manually_stopped);
    assert_eq!(state.last_error, Some(err));
    assert!(r.couch.task_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn continuous_task_vanishing_is_an_error() {
    let mut r = TestReplication::continuous_pull();
    let task_id = r.start().await;
    r.wait_for(|s| s.mode == ReplicationMode::Idle).await;

    r.couch.drop_task(&task_id);
    let state = r.wait_for(|s| !s.running).await;
    assert!(!state.manually_stopped);
    assert_eq!(
        state.last_error,
        Some(ReplicationError::TaskVanished { task_id })
    );
}

#[tokio::test(start_paused = true)]
async fn one_shot_vanishing_midway_is_an_error() {
    let mut r = TestReplication::pull();
    let task_id = r.start().await;
    r.couch.set_progress(&task_id, 3, 10);
    r.wait_for(|s| s.completed == 3).await;

    r.couch.drop_task(&task_id);
    let state = r.wait_for(|s| !s.running).await;
    assert_eq!(
        state.last_error.as_ref().map(ReplicationError::kind),
        Some(ErrorKind::TaskVanished)
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_submit_once() {
    let r = TestReplication::continuous_pull();
    r.couch.set_latency(Duration::from_millis(200));

    let (a, b) = tokio::join!(r.controller.start(), r.controller.start());
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.retain(|o| *o != StartOutcome::AlreadyRunning);
    assert_eq!(outcomes.len(), 1);

    assert_eq!(r.controller.start().await.unwrap(), StartOutcome::AlreadyRunning);
    assert_eq!(r.couch.count(Method::Post, REPLICATE_PATH), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_while_stopped_is_a_no_op() {
    let r = TestReplication::pull();
    r.controller.stop().await.unwrap();
    advance(3).await;

    assert!(r.couch.requests().is_empty());
    assert!(!r.controller.was_manually_stopped());
    assert_eq!(r.controller.mode(), ReplicationMode::Stopped);
}

#[tokio::test(start_paused = true)]
async fn parameters_frozen_while_running() {
    let r = TestReplication::continuous_pull();
    r.start().await;

    let rejected = [
        r.controller.set_filter(Some("app/by_owner".into())),
        r.controller.set_create_target(true),
        r.controller.set_headers(Default::default()),
        r.controller.set_credentials(None),
        r.controller.set_filter_params(None),
        r.controller.set_extra_options(Default::default()),
    ];
    for result in rejected {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidState);
    }

    r.controller.stop().await.unwrap();
    r.controller.set_filter(Some("app/by_owner".into())).unwrap();
    assert_eq!(r.controller.config().filter.as_deref(), Some("app/by_owner"));
}

#[tokio::test(start_paused = true)]
async fn invalid_configuration_never_reaches_server() {
    let r = TestReplication::new(ReplicationConfig::pull("ftp://nowhere"));
    let err = r.controller.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);

    let r = TestReplication::new(ReplicationConfig::pull(REMOTE_URL).with_filter("no-slash"));
    let err = r.controller.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);

    advance(3).await;
    assert!(r.couch.requests().is_empty());
    assert!(!r.controller.is_running());
}

#[tokio::test(start_paused = true)]
async fn continuous_moves_between_idle_and_active() {
    let mut r = TestReplication::continuous_pull();
    let task_id = r.start().await;
    r.wait_for(|s| s.mode == ReplicationMode::Idle).await;

    r.couch.set_progress(&task_id, 10, 12);
    let state = r.wait_for(|s| s.mode == ReplicationMode::Active).await;
    assert_eq!((state.completed, state.total), (10, 12));

    r.couch.set_progress(&task_id, 12, 12);
    let state = r.wait_for(|s| s.mode == ReplicationMode::Idle).await;
    assert_eq!(state.completed, 12);
    assert!(state.running);
}

#[tokio::test(start_paused = true)]
async fn task_error_reports_offline() {
    let mut r = TestReplication::continuous_push();
    let task_id = r.start().await;

    r.couch.set_task_error(&task_id, Some("unauthorized"));
    let state = r.wait_for(|s| s.mode == ReplicationMode::Offline).await;
    assert!(state.running);

    r.couch.set_task_error(&task_id, None);
    r.wait_for(|s| s.mode == ReplicationMode::Idle).await;

    r.couch.set_status(&task_id, Some("Offline"));
    r.wait_for(|s| s.mode == ReplicationMode::Offline).await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_server_keeps_mode_and_recovers() {
    let mut r = TestReplication::continuous_pull();
    let task_id = r.start().await;
    r.wait_for(|s| s.mode == ReplicationMode::Idle).await;

    r.couch.set_offline(true);
    let state = r.wait_for(|s| s.last_error.is_some()).await;
    assert_eq!(state.mode, ReplicationMode::Idle);
    assert!(state.running);
    assert_eq!(
        state.last_error.as_ref().map(ReplicationError::kind),
        Some(ErrorKind::TransportFailure)
    );

    advance(10).await;
    r.couch.set_offline(false);
    r.couch.set_progress(&task_id, 1, 4);
    let state = r.wait_for(|s| s.completed == 1).await;
    assert_eq!(state.mode, ReplicationMode::Active);
}

#[tokio::test(start_paused = true)]
async fn one_shot_that_never_appears_finishes_cleanly() {
    let mut r = TestReplication::pull();
    r.couch.hide_next_start();
    r.start().await;

    let state = r.wait_for(|s| !s.running).await;
    assert!(state.last_error.is_none());
    assert!(r.couch.count(Method::Get, ACTIVE_TASKS_PATH) > test_settings().appearance_grace_polls as usize);
}

#[tokio::test(start_paused = true)]
async fn late_appearing_task_is_tolerated() {
    let mut r = TestReplication::continuous_pull();
    r.couch.hide_next_start();
    let task_id = r.start().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(r.controller.is_running());

    r.couch.list_task(&task_id);
    r.couch.set_progress(&task_id, 2, 5);
    let state = r.wait_for(|s| s.completed == 2).await;
    assert_eq!(state.mode, ReplicationMode::Active);
}

#[tokio::test(start_paused = true)]
async fn continuous_that_never_appears_vanishes() {
    let mut r = TestReplication::continuous_pull();
    r.couch.hide_next_start();
    r.start().await;

    let state = r.wait_for(|s| !s.running).await;
    assert_eq!(
        state.last_error.as_ref().map(ReplicationError::kind),
        Some(ErrorKind::TaskVanished)
    );
}

#[tokio::test(start_paused = true)]
async fn restart_after_stop_begins_fresh() {
    let mut r = TestReplication::continuous_pull();
    let first = r.start().await;
    r.couch.set_progress(&first, 4, 9);
    r.wait_for(|s| s.completed == 4).await;
    r.controller.stop().await.unwrap();

    let second = r.start().await;
    assert_ne!(first, second);
    let state = r.controller.state();
    assert!(state.running);
    assert!(!state.manually_stopped);
    assert!(state.last_error.is_none());
    assert_eq!(state.completed, 0);
    assert_eq!(r.couch.count(Method::Post, REPLICATE_PATH), 3);
}

#[tokio::test(start_paused = true)]
async fn headers_and_credentials_are_sent() {
    let config = ReplicationConfig::push(REMOTE_URL)
        .continuous()
        .with_header("X-Tenant", "7")
        .with_credentials(OAuthCredentials::new("ck", "cs", "tok", "ts"));
    let r = TestReplication::new(config);
    let task_id = r.start().await;
    advance(2).await;

    assert_eq!(r.couch.task(&task_id).unwrap().target, REMOTE_URL);
    let requests = r.couch.requests();
    assert!(requests.len() >= 2);
    for request in &requests {
        assert_eq!(request.headers.get("X-Tenant").map(String::as_str), Some("7"));
    }

    let body = requests[0].body.as_ref().unwrap();
    assert_eq!(body["target"]["url"], REMOTE_URL);
    assert_eq!(body["target"]["auth"]["oauth"]["token"], "tok");
    assert_eq!(body["headers"], json!({ "X-Tenant": "7" }));
}

#[tokio::test(start_paused = true)]
async fn pending_start_is_visible_and_cancellable() {
    let r = TestReplication::continuous_pull();
    r.couch.set_latency(Duration::from_secs(2));

    let controller = r.controller.clone();
    let starting = tokio::spawn(async move { controller.start().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let requests = r.controller.current_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].purpose, RequestPurpose::Start);

    r.controller.stop().await.unwrap();
    assert_eq!(starting.await.unwrap(), Err(ReplicationError::Cancelled));
    assert_eq!(r.controller.mode(), ReplicationMode::Stopped);
}

#[tokio::test(start_paused = true)]
async fn delivered_task_lists_pick_the_right_record() {
    let settings = test_settings().with_poll_interval(Duration::from_secs(3600));
    let r = TestReplication::with_settings(ReplicationConfig::pull(REMOTE_URL), settings);
    let task_id = r.start().await;

    let tasks = [
        json!({ "type": "indexer", "design_document": "_design/app" }),
        json!({ "type": "replication", "replication_id": "other", "completed": 99, "total": 99 }),
        json!({ "type": "replication", "replication_id": task_id, "completed": 7, "total": 8 }),
    ]
    .iter()
    .map(|v| couchrep_engine::ActiveTask::from_json(v).unwrap())
    .collect();
    r.controller.deliver_tasks(tasks).await.unwrap();

    assert_eq!(r.controller.completed(), 7);
    assert_eq!(r.controller.total(), 8);
}

#[tokio::test(start_paused = true)]
async fn every_published_snapshot_is_consistent() {
    let mut r = TestReplication::pull();
    let task_id = r.start().await;
    for (completed, total) in [(1, 6), (3, 6), (6, 6)] {
        r.couch.set_progress(&task_id, completed, total);
        r.wait_for(|s| s.completed == completed as u64).await;
    }
    r.couch.drop_task(&task_id);
    r.wait_for(|s| !s.running).await;

    let mut seen = vec![r.controller.state()];
    seen.extend(r.drain());
    assert!(seen.iter().all(|s| s.is_consistent()));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_controller_closes_subscriptions() {
    let TestReplication {
        couch: _couch,
        controller,
        mut updates,
    } = TestReplication::continuous_pull();
    controller.start().await.unwrap();
    drop(controller);

    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        while updates.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test(start_paused = true)]
async fn stop_after_quick_restart_answers_every_caller() {
    let r = TestReplication::continuous_pull();
    r.start().await;
    r.couch.set_latency(Duration::from_secs(5));

    let controller = r.controller.clone();
    let first_stop = tokio::spawn(async move { controller.stop().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let controller = r.controller.clone();
    let restart = tokio::spawn(async move { controller.start().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    r.controller.stop().await.unwrap();
    assert_eq!(restart.await.unwrap(), Err(ReplicationError::Cancelled));

    let first = tokio::time::timeout(Duration::from_secs(60), first_stop)
        .await
        .expect("first stop never resolved");
    first.unwrap().unwrap();
    assert!(r.controller.current_requests().is_empty());
    assert_eq!(r.controller.mode(), ReplicationMode::Stopped);
}

#[tokio::test(start_paused = true)]
async fn blocking_one_shot_start_is_not_timed_out() {
    let r = TestReplication::pull();
    r.couch.set_latency(Duration::from_secs(45));

    let outcome = r.controller.start().await.unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));
    assert!(r.controller.is_running());
}

#[tokio::test(start_paused = true)]
async fn continuous_start_still_times_out() {
    let r = TestReplication::continuous_pull();
    r.couch.set_latency(Duration::from_secs(45));

    let err = r.controller.start().await.unwrap_err();
    assert_eq!(err, ReplicationError::Timeout);
    assert_eq!(r.controller.last_error(), Some(ReplicationError::Timeout));
    assert!(!r.controller.is_running());
}

#[tokio::test(start_paused = true)]
async fn polling_ignores_foreign_records() {
    let mut r = TestReplication::continuous_pull();
    r.couch.add_foreign_record(json!({ "type": "indexer", "design_document": "_design/app" }));
    r.couch.add_foreign_record(json!({
        "type": "replication", "replication_id": "sim-10+continuous", "completed": 99, "total": 99
    }));
    let task_id = r.start().await;
    assert_eq!(task_id, "sim-1+continuous");

    r.couch.set_progress(&task_id, 2, 5);
    let state = r.wait_for(|s| s.completed == 2).await;
    assert_eq!(state.total, 5);
    advance(3).await;
    assert!(r.drain().iter().all(|s| s.total != 99));
    assert_eq!(r.controller.total(), 5);
}

#[tokio::test(start_paused = true)]
async fn one_reconciliation_publishes_one_snapshot() {
    let mut r = TestReplication::continuous_pull();
    let task_id = r.start().await;
    r.wait_for(|s| s.mode == ReplicationMode::Idle).await;
    r.drain();

    r.couch.set_progress(&task_id, 3, 8);
    advance(5).await;

    let seen = r.drain();
    assert_eq!(seen.len(), 1);
    let state = &seen[0];
    assert_eq!(state.mode, ReplicationMode::Active);
    assert_eq!((state.completed, state.total), (3, 8));
    assert_eq!(state.status_text, "Processed 3 / 8 changes");
}
