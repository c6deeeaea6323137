//! Command handlers for the CLI
//!
//! - `servers`: configured servers with enablement and health
//! - `tools`: the tool index, optionally filtered
//! - `call`: a single routed tool call
//! - `health`: an on-demand probe of every enabled server
//! - `validate`: configuration check, no connections

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::mcp::transport::stdio::command_available;
use crate::mcp::transport::TransportKind;

pub mod call;
pub mod health;
pub mod servers;
pub mod tools;

/// Build and initialize a gateway from `config`
///
/// Servers that fail to connect are reported as unhealthy, not as an error.
pub async fn start_gateway(config: GatewayConfig) -> Result<Gateway> {
    let gateway = Gateway::new(config)?;
    gateway.initialize().await?;
    Ok(gateway)
}

/// Print a summary of a valid configuration. Enabled stdio servers whose
/// command cannot be found are reported as warnings on stderr.
///
/// # Errors
///
/// Returns the first validation failure.
pub fn validate(config: &GatewayConfig) -> Result<()> {
    config.validate()?;
    for (server_id, command) in missing_commands(config) {
        eprintln!("Warning: server `{server_id}`: command `{command}` not found");
    }
    let enabled = config.servers.iter().filter(|s| s.enabled).count();
    println!(
        "Configuration is valid: {} server(s), {} enabled",
        config.servers.len(),
        enabled
    );
    Ok(())
}

/// Enabled stdio servers whose command is neither on `PATH` nor an existing
/// file, as `(server id, command)`
pub fn missing_commands(config: &GatewayConfig) -> Vec<(String, String)> {
    config
        .servers
        .iter()
        .filter(|s| s.enabled && s.transport == TransportKind::Stdio)
        .filter_map(|s| {
            s.command
                .as_deref()
                .filter(|c| !command_available(c))
                .map(|c| (s.id.clone(), c.to_string()))
        })
        .collect()
}

/// Pretty-print a serializable value on stdout
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
