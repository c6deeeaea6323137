//! toolgate - command-line front end for the tool gateway

use anyhow::Result;

use toolgate::cli::{Cli, Commands};
use toolgate::commands;
use toolgate::config::GatewayConfig;
use toolgate::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let mut config = GatewayConfig::load(&cli.config)?;
    if cli.verbose {
        config.logging.level = "toolgate=debug".to_string();
    }
    init_tracing(&config.logging)?;
    tracing::debug!(path = %cli.config, servers = config.servers.len(), "configuration loaded");

    if let Commands::Validate = cli.command {
        return commands::validate(&config);
    }

    let gateway = commands::start_gateway(config).await?;
    let result = match cli.command {
        Commands::Servers { json } => commands::servers::list_servers(&gateway, json),
        Commands::Tools { pattern, json } => {
            commands::tools::list_tools(&gateway, pattern.as_deref(), json)
        }
        Commands::Call {
            tool,
            args,
            server,
            timeout_ms,
        } => commands::call::call_tool(&gateway, &tool, &args, server, timeout_ms).await,
        Commands::Health { json } => commands::health::check_health(&gateway, json).await,
        Commands::Validate => Ok(()),
    };
    gateway.shutdown().await;
    result
}
