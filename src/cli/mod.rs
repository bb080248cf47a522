//! CLI module for palmlink
//!
//! - `serve`: run the daemon (default)
//! - `devices`, `revoke`, `rename`: manage paired devices
//! - `status`: show daemon, session and tunnel state

use crate::server::config::AppConfig;
use clap::{Parser, Subcommand};

pub mod devices;
pub mod status;

/// Terminal agent sessions on your phone
#[derive(Parser, Debug)]
#[command(name = "palmlink")]
#[command(about = "Bridge terminal coding-agent sessions to your phone")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon (default)
    Serve {
        /// Start a pairing session right away and print its code
        #[arg(long)]
        pair: bool,
    },
    /// List paired devices
    Devices,
    /// Revoke a paired device
    Revoke {
        /// Device identifier
        device_id: String,
    },
    /// Rename a paired device
    Rename {
        /// Device identifier
        device_id: String,
        /// New display name
        name: String,
    },
    /// Show daemon, session and tunnel status
    Status,
}

impl Cli {
    /// Whether this invocation runs the daemon.
    pub fn is_serve(&self) -> bool {
        matches!(self.command, None | Some(Commands::Serve { .. }))
    }
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        None => crate::server::run(config, false).await,
        Some(Commands::Serve { pair }) => crate::server::run(config, pair).await,
        Some(Commands::Devices) => devices::list(&config).await,
        Some(Commands::Revoke { device_id }) => devices::revoke(&config, &device_id).await,
        Some(Commands::Rename { device_id, name }) => {
            devices::rename(&config, &device_id, &name).await
        }
        Some(Commands::Status) => status::run(&config).await,
    }
}
