//! fleetgridd: the fleetgrid daemon.
//!
//! Hosts the capacity provider over the object store:
//! - `serve` runs the capacity class readiness loop until Ctrl-C
//! - `create`, `delete`, `get`, `list` and `instance-types` call the
//!   provider once and print the result as JSON
//! - `apply` loads groups, units, classes and claims from a JSON manifest
//!
//! # Usage
//!
//! ```text
//! fleetgridd --data-dir /var/lib/fleetgrid apply fleet.json
//! fleetgridd --data-dir /var/lib/fleetgrid create my-claim
//! fleetgridd --config /etc/fleetgrid.toml serve
//! ```

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::{ClusterConnection, Options, Settings};

#[derive(Parser)]
#[command(name = "fleetgridd", about = "fleetgrid capacity provider")]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep capacity classes marked ready until interrupted.
    Serve,

    /// Provision a unit for a stored claim and record the binding.
    Create {
        /// Claim name.
        claim: String,
    },

    /// Release the unit bound to a stored claim.
    Delete {
        /// Claim name.
        claim: String,
    },

    /// Show the claim backed by the unit with this provider id.
    Get { provider_id: String },

    /// Show every claimed unit as a claim.
    List,

    /// Show the instance types a capacity class offers.
    InstanceTypes {
        /// Capacity class name.
        class: String,
    },

    /// Create or update objects from a JSON manifest.
    Apply {
        /// Path to the manifest.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.options)?;
    let connection = ClusterConnection::resolve(&settings)?;
    info!(connection = %connection.describe(), "resolved management cluster");
    let store = connection.open_store()?;

    match cli.command {
        Command::Serve => commands::serve(store, &settings).await,
        Command::Create { claim } => commands::create(store, &settings, &claim).await,
        Command::Delete { claim } => commands::delete(store, &settings, &claim).await,
        Command::Get { provider_id } => commands::get(store, &provider_id).await,
        Command::List => commands::list(store).await,
        Command::InstanceTypes { class } => commands::instance_types(store, &class).await,
        Command::Apply { file } => commands::apply(&store, &file),
    }
}
