//! couchrep CLI
//!
//! Command-line front end for server-side CouchDB replications.
//!
//! # Commands
//!
//! - `replicate` - Start a replication and follow its progress
//! - `tasks` - List the replications a server is running
//! - `cancel` - Cancel a replication by its endpoints

mod client;
mod commands;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Start, watch and cancel CouchDB replications.
#[derive(Parser)]
#[command(name = "couchrep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// URL of the server that runs the replicator
    #[arg(global = true, short, long, default_value = "http://127.0.0.1:5984")]
    server: String,

    /// Extra header sent with every request, as NAME:VALUE
    #[arg(global = true, short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Endpoints of a replication.
#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// Remote database URL
    remote: String,

    /// Local database name on the server
    #[arg(short, long)]
    local: String,

    /// Push local changes to the remote instead of pulling
    #[arg(long)]
    push: bool,

    /// Keep replicating new changes
    #[arg(short, long)]
    continuous: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a replication and follow it until it stops
    Replicate {
        #[command(flatten)]
        endpoints: EndpointArgs,

        /// Create the target database if missing
        #[arg(long)]
        create_target: bool,

        /// Filter function, as designdoc/filtername
        #[arg(short, long)]
        filter: Option<String>,

        /// Filter parameter, as KEY=VALUE
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Status poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll_ms: u64,
    },

    /// List replication tasks
    Tasks {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Cancel a replication
    Cancel {
        #[command(flatten)]
        endpoints: EndpointArgs,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Replicate {
            endpoints,
            create_target,
            filter,
            params,
            poll_ms,
        } => {
            let options = commands::replicate::Options {
                create_target,
                filter,
                params,
                poll_ms,
            };
            commands::replicate::run(&cli.server, &cli.headers, &endpoints, options).await?;
        }
        Commands::Tasks { format } => {
            commands::tasks::run(&cli.server, &cli.headers, &format).await?;
        }
        Commands::Cancel { endpoints } => {
            commands::cancel::run(&cli.server, &cli.headers, &endpoints).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_param_parsing() {
        assert_eq!(
            parse_header("X-Tenant: 7").unwrap(),
            ("X-Tenant".to_string(), "7".to_string())
        );
        assert!(parse_header(": 7").is_err());
        assert!(parse_header("novalue").is_err());
        assert_eq!(
            parse_param("owner=a=b").unwrap(),
            ("owner".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn replicate_arguments() {
        let cli = Cli::try_parse_from([
            "couchrep",
            "replicate",
            "https://remote.example/db",
            "--local",
            "inbox",
            "--continuous",
            "-p",
            "owner=ada",
        ])
        .unwrap();
        match cli.command {
            Commands::Replicate {
                endpoints, params, ..
            } => {
                assert_eq!(endpoints.local, "inbox");
                assert!(endpoints.continuous);
                assert!(!endpoints.push);
                assert_eq!(params.len(), 1);
            }
            _ => panic!("expected replicate"),
        }
    }
}
