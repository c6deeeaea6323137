//! `toolgate call`

use std::time::Duration;

use serde_json::Value;

use super::print_json;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::tool_call::CallOptions;

/// Parse the `--args` value; it must be a JSON object
pub fn parse_arguments(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| GatewayError::Validation(format!("--args is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(GatewayError::Validation("--args must be a JSON object".into()).into());
    }
    Ok(value)
}

/// Call one tool and print the full response as JSON.
///
/// # Errors
///
/// Invalid arguments, or a failed call (after the response is printed) so
/// the process exits non-zero.
pub async fn call_tool(
    gateway: &Gateway,
    tool: &str,
    raw_args: &str,
    server: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let arguments = parse_arguments(raw_args)?;
    let options = CallOptions {
        server_id: server,
        timeout: timeout_ms.map(Duration::from_millis),
        ..Default::default()
    };
    let response = gateway.call_tool(tool, arguments, options).await;
    print_json(&response)?;
    match response.error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
        assert!(parse_arguments("[1, 2]").is_err());
        assert!(parse_arguments("{not json").is_err());
    }
}
