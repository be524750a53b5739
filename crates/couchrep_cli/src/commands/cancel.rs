//! Cancel command implementation.

use super::{base_config, connect};
use crate::EndpointArgs;
use couchrep_engine::{ReplicationError, RequestEngine, RestRequest};
use couchrep_protocol::{error_reason, stop_body, REPLICATE_PATH};

/// Runs the cancel command.
pub async fn run(
    server: &str,
    headers: &[(String, String)],
    endpoints: &EndpointArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = base_config(endpoints);
    config.validate()?;

    let engine = connect(server, headers)?;
    let body = stop_body(&config, &endpoints.local);
    let response = engine.submit(RestRequest::post(REPLICATE_PATH, body)).await?;

    match response.status {
        status if (200..300).contains(&status) => println!("Replication cancelled"),
        404 => println!("No such replication running"),
        status => {
            return Err(ReplicationError::ServerRejected {
                status,
                reason: error_reason(&response.body),
            }
            .into())
        }
    }
    Ok(())
}
