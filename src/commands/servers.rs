//! `toolgate servers`

use prettytable::{format, row, Table};

use super::print_json;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::health::HealthStatus;

/// List registered servers with their tool count and health
pub fn list_servers(gateway: &Gateway, json: bool) -> Result<()> {
    let summaries = gateway.list_servers();
    if json {
        return print_json(&summaries);
    }
    if summaries.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.set_titles(row!["ID", "Name", "Category", "Transport", "Enabled", "Tools", "Health"]);
    for server in summaries {
        let health = if server.enabled {
            gateway
                .health()
                .status(&server.id)
                .unwrap_or(HealthStatus::Unknown)
                .to_string()
        } else {
            "-".to_string()
        };
        table.add_row(row![
            server.id,
            server.name,
            server.category,
            server.transport,
            if server.enabled { "yes" } else { "no" },
            server.tool_count,
            health
        ]);
    }
    table.printstd();
    Ok(())
}
