//! `toolgate health`

use prettytable::{format, row, Table};

use super::print_json;
use crate::error::Result;
use crate::gateway::Gateway;

/// Probe every enabled server now and print the results
pub async fn check_health(gateway: &Gateway, json: bool) -> Result<()> {
    gateway.check_health().await;
    let results = gateway.get_health();
    if json {
        return print_json(&serde_json::json!({
            "summary": gateway.health_summary(),
            "servers": results,
        }));
    }
    if results.is_empty() {
        println!("No servers monitored.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.set_titles(row!["Server", "Status", "Latency", "Failures", "Last error"]);
    for r in results {
        table.add_row(row![
            r.server_id,
            r.status,
            r.latency_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms} ms")),
            r.consecutive_failures,
            r.last_error.unwrap_or_default()
        ]);
    }
    table.printstd();

    let summary = gateway.health_summary();
    println!(
        "{} healthy, {} degraded, {} unhealthy, {} unknown",
        summary.healthy.len(),
        summary.degraded.len(),
        summary.unhealthy.len(),
        summary.unknown.len()
    );
    Ok(())
}
