//! CLI command implementations.

pub mod cancel;
pub mod replicate;
pub mod tasks;

use crate::client::ReqwestClient;
use crate::EndpointArgs;
use couchrep_engine::{HttpEngine, ReplicationConfig};
use std::time::Duration;

/// Connects to the replicator at `server`.
pub fn connect(
    server: &str,
    headers: &[(String, String)],
) -> Result<HttpEngine<ReqwestClient>, Box<dyn std::error::Error>> {
    let client = ReqwestClient::new(Duration::from_secs(30))?;
    let engine = headers
        .iter()
        .fold(HttpEngine::new(server, client), |engine, (name, value)| {
            engine.with_default_header(name.clone(), value.clone())
        });
    Ok(engine)
}

/// Builds the configuration described by `endpoints`.
pub fn base_config(endpoints: &EndpointArgs) -> ReplicationConfig {
    let config = if endpoints.push {
        ReplicationConfig::push(endpoints.remote.clone())
    } else {
        ReplicationConfig::pull(endpoints.remote.clone())
    };
    if endpoints.continuous {
        config.continuous()
    } else {
        config
    }
}
