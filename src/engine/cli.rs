//! devfleet CLI Module
//! Command-line interface for the update server, operators and device agents

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::config::CONFIG_FILE_NAME;
use crate::engine::models::UpdatePolicy;

#[derive(Parser, Debug)]
#[command(name = "devfleet")]
#[command(author = "devfleet Team")]
#[command(version)]
#[command(about = "Update coordination for fleets of headless devices", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./devfleet.config.json)
    #[arg(short, long, global = true, env = "DEVFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Where operator commands reach the server
#[derive(clap::Args, Debug, Clone)]
pub struct RemoteArgs {
    /// Update server URL
    #[arg(long, env = "DEVFLEET_SERVER", default_value = "http://127.0.0.1:54380")]
    pub server: String,

    /// Operator API key
    #[arg(long, env = "DEVFLEET_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default server config
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Start the update server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Operator API key management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Package a source tree and publish it as a new update
    Publish {
        /// Version to publish, e.g. v1.2.0
        version: String,

        /// Application source tree
        #[arg(short, long, default_value = ".")]
        source: PathBuf,

        /// Release notes
        #[arg(short, long, default_value = "")]
        description: String,

        /// Distribution timing
        #[arg(long, default_value = "scheduled", value_parser = parse_policy)]
        policy: UpdatePolicy,

        /// OS package required by this release (repeatable)
        #[arg(long = "system-package")]
        system_packages: Vec<String>,

        /// Dependency manifest to ship instead of the tree's requirements.txt
        #[arg(long)]
        dependency_manifest: Option<PathBuf>,

        /// Protected-path manifest to exclude from the snapshot
        #[arg(long)]
        protected_manifest: Option<PathBuf>,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Published updates
    Updates {
        #[command(subcommand)]
        action: UpdatesAction,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Registered devices
    Devices {
        #[command(subcommand)]
        action: DevicesAction,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Device update agent
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

fn parse_policy(raw: &str) -> Result<UpdatePolicy, String> {
    raw.parse::<UpdatePolicy>()
        .map_err(|other| format!("unknown policy '{other}', expected scheduled or urgent"))
}

#[derive(Subcommand, Debug)]
pub enum KeysAction {
    /// List operator keys
    List,

    /// Create a new operator key
    Create {
        /// Key name/description
        #[arg(short, long)]
        name: String,
    },

    /// Revoke an operator key
    Revoke {
        /// Key ID to revoke
        key_id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum UpdatesAction {
    /// List published updates, newest first
    List,

    /// Show one update
    Show { version: String },
}

#[derive(Subcommand, Debug)]
pub enum DevicesAction {
    /// List registered devices
    List,

    /// Show one device
    Show { uuid: String },

    /// Refuse all further heartbeats and update checks from a device
    Deactivate { uuid: String },

    /// Re-enable a deactivated device
    Reactivate { uuid: String },
}

#[derive(Subcommand, Debug)]
pub enum AgentAction {
    /// Run the agent loop until interrupted
    Run,

    /// Run a single update cycle
    Check {
        /// Treat the device as idle for this many minutes
        #[arg(long)]
        idle_minutes: Option<u64>,
    },

    /// Show the persisted agent state
    Status,
}

impl Cli {
    /// `--config`, else `./devfleet.config.json`, else the per-user config dir
    pub fn config_path(&self) -> PathBuf {
        if let Some(path) = &self.config {
            return path.clone();
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|dir| dir.join("devfleet").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
            .unwrap_or(local)
    }
}
