mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use dra_plugin_client::{logging, ClientConfig, NodeMethod};
use std::path::Path;

fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load_from(path),
        None => ClientConfig::load(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Plugins => commands::plugins::cmd_plugins(&load_config(config_path)?),
        Commands::Prepare(args) => {
            let config = load_config(config_path)?;
            commands::call::cmd_call(&config, NodeMethod::PrepareResources, args).await?
        }
        Commands::Unprepare(args) => {
            let config = load_config(config_path)?;
            commands::call::cmd_call(&config, NodeMethod::UnprepareResources, args).await?
        }
        Commands::Serve {
            socket,
            versions,
            delay_ms,
        } => commands::serve::cmd_serve(&socket, versions, delay_ms).await?,
    }

    Ok(())
}
