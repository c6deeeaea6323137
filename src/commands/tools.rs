//! `toolgate tools`

use prettytable::{format, row, Table};

use super::print_json;
use crate::error::Result;
use crate::gateway::Gateway;

const DESCRIPTION_WIDTH: usize = 60;

/// List indexed tools, optionally filtered by name or glob
pub fn list_tools(gateway: &Gateway, pattern: Option<&str>, json: bool) -> Result<()> {
    let tools = match pattern {
        Some(p) => gateway.find_tools(p),
        None => gateway.get_tools(),
    };
    if json {
        return print_json(&tools);
    }
    if tools.is_empty() {
        println!("No tools found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.set_titles(row!["Tool", "Server", "Category", "Description"]);
    for cap in &tools {
        table.add_row(row![
            cap.tool.name,
            cap.server_id,
            cap.category,
            truncate(&cap.tool.description, DESCRIPTION_WIDTH)
        ]);
    }
    table.printstd();
    println!("{} tool(s)", tools.len());
    Ok(())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let cut: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{cut}...")
}
