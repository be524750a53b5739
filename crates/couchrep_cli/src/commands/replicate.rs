//! Replicate command implementation.

use super::{base_config, connect};
use crate::EndpointArgs;
use couchrep_engine::{
    ControllerConfig, JsonObject, NamedDatabase, ReplicationController, ReplicationState,
    StartOutcome,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Options beyond the endpoints.
#[derive(Debug, Default)]
pub struct Options {
    /// Create the target database if missing.
    pub create_target: bool,
    /// Filter function.
    pub filter: Option<String>,
    /// Filter parameters.
    pub params: Vec<(String, String)>,
    /// Poll interval in milliseconds.
    pub poll_ms: u64,
}

/// Runs the replicate command.
///
/// Follows the replication until it stops. Ctrl-C cancels it on the server.
pub async fn run(
    server: &str,
    headers: &[(String, String)],
    endpoints: &EndpointArgs,
    options: Options,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = connect(server, headers)?;

    let mut config = base_config(endpoints).with_create_target(options.create_target);
    if let Some(filter) = options.filter {
        config = config.with_filter(filter);
    }
    if !options.params.is_empty() {
        let params: JsonObject = options
            .params
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        config = config.with_filter_params(params);
    }

    let settings =
        ControllerConfig::new().with_poll_interval(Duration::from_millis(options.poll_ms.max(100)));
    let controller = ReplicationController::new(
        Arc::new(NamedDatabase::new(endpoints.local.clone())),
        config,
        engine,
        settings,
    )?;
    let mut updates = controller.subscribe();

    if let StartOutcome::Started { task_id } = controller.start().await? {
        info!(%task_id, server, "replication started");
    }

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(state) => {
                    print_state(&state);
                    if !state.running {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut interrupt => {
                info!("interrupted, cancelling replication");
                if let Err(e) = controller.stop().await {
                    warn!(error = %e, "server did not acknowledge cancellation");
                }
                break;
            }
        }
    }

    let state = controller.state();
    match state.last_error {
        Some(error) if !state.manually_stopped => Err(error.into()),
        _ => Ok(()),
    }
}

fn print_state(state: &ReplicationState) {
    let progress = state
        .progress()
        .map(|p| format!("{:>5.1}%", p * 100.0))
        .unwrap_or_else(|| "     -".to_string());
    println!(
        "{:<8} {:>8} / {:<8} {} {}",
        state.mode, state.completed, state.total, progress, state.status_text
    );
    if let Some(error) = &state.last_error {
        println!("         last error: {error}");
    }
}
