use clap::{Parser, Subcommand};
use dra_plugin_client::api::ApiVersion;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dractl")]
#[command(version)]
#[command(about = "Talk to node-local resource driver plugins", long_about = None)]
pub(crate) struct Cli {
    /// Debug logging (DRACTL_LOG / RUST_LOG take precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (default: $DRACTL_CONFIG_DIR/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List configured plugins
    Plugins,

    /// Ask a plugin to prepare resources
    Prepare(CallArgs),

    /// Ask a plugin to release resources
    Unprepare(CallArgs),

    /// Run a demo plugin on a Unix socket
    Serve {
        /// Socket to listen on
        #[arg(long)]
        socket: PathBuf,

        /// Contract versions to serve (repeatable; default: all)
        #[arg(long = "api", value_parser = parse_api_version)]
        versions: Vec<ApiVersion>,

        /// Artificial latency added to every response
        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },
}

#[derive(clap::Args)]
pub(crate) struct CallArgs {
    /// Registered plugin name
    pub name: String,

    /// JSON request body
    #[arg(long, default_value = "{}")]
    pub payload: String,

    /// Caller-side deadline in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

fn parse_api_version(raw: &str) -> Result<ApiVersion, String> {
    raw.parse()
}
