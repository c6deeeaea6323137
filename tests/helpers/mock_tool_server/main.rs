//! Mock tool server binary for integration tests
//!
//! Speaks JSON-RPC 2.0 over stdin/stdout like a real tool server so the
//! stdio transport, the gateway and the CLI can be exercised end to end.
//!
//! # Handled Methods
//!
//! - `initialize` -- protocol version `2025-11-25`, `tools` capability.
//! - `notifications/initialized` -- swallowed.
//! - `tools/list` -- `echo`, `add`, `fail`, `slow`, `crash`.
//! - `tools/call` -- see the tool list below.
//! - `ping` -- empty result, or `-32601` when `MOCK_SERVER_NO_PING` is set.
//!
//! # Tools
//!
//! - `echo` -- returns `arguments` as `structuredContent`.
//! - `add` -- returns `{"sum": a + b}` as JSON text content.
//! - `fail` -- returns `isError: true` with the `message` argument.
//! - `slow` -- sleeps `ms` milliseconds (default 1000) then answers `"done"`.
//!   Runs on its own thread so other requests are answered meanwhile.
//! - `crash` -- exits the process without answering.
//!
//! # Environment
//!
//! - `MOCK_SERVER_FRAMING=content-length` switches to `Content-Length` framing.
//! - `MOCK_SERVER_NO_PING` makes `ping` unsupported.
//! - `MOCK_SERVER_PROTOCOL_VERSION` overrides the advertised version.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

#[derive(Clone, Copy, PartialEq)]
enum Framing {
    Newline,
    ContentLength,
}

#[derive(Clone)]
struct Output {
    framing: Framing,
    out: Arc<Mutex<io::Stdout>>,
}

impl Output {
    fn send(&self, message: &Value) {
        let body = message.to_string();
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        let written = match self.framing {
            Framing::Newline => writeln!(out, "{body}"),
            Framing::ContentLength => write!(out, "Content-Length: {}\r\n\r\n{body}", body.len()),
        };
        if written.is_err() || out.flush().is_err() {
            std::process::exit(0);
        }
    }
}

fn main() {
    let framing = match std::env::var("MOCK_SERVER_FRAMING").as_deref() {
        Ok("content-length") => Framing::ContentLength,
        _ => Framing::Newline,
    };
    let output = Output {
        framing,
        out: Arc::new(Mutex::new(io::stdout())),
    };
    let mut input = BufReader::new(io::stdin());

    while let Some(raw) = read_message(&mut input, framing) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                output.send(&make_error(&Value::Null, -32700, "Parse error"));
                continue;
            }
        };
        handle(&request, &output);
    }
}

/// Read one frame; `None` on EOF
fn read_message(input: &mut impl BufRead, framing: Framing) -> Option<String> {
    match framing {
        Framing::Newline => {
            let mut line = String::new();
            match input.read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line),
            }
        }
        Framing::ContentLength => {
            let mut length = None;
            loop {
                let mut header = String::new();
                match input.read_line(&mut header) {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
                let header = header.trim();
                if header.is_empty() {
                    if length.is_some() {
                        break;
                    }
                    continue;
                }
                if let Some(value) = header
                    .split_once(':')
                    .filter(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                    .map(|(_, v)| v.trim())
                {
                    length = value.parse::<usize>().ok();
                }
            }
            let mut body = vec![0u8; length?];
            input.read_exact(&mut body).ok()?;
            String::from_utf8(body).ok()
        }
    }
}

fn handle(request: &Value, output: &Output) {
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let Some(id) = request.get("id").cloned().filter(|id| !id.is_null()) else {
        // Notifications need no answer
        return;
    };

    let response = match method {
        "initialize" => handle_initialize(&id),
        "tools/list" => handle_tools_list(&id),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            let name = params.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match name.as_str() {
                "slow" => {
                    let output = output.clone();
                    std::thread::spawn(move || {
                        let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(1000);
                        std::thread::sleep(Duration::from_millis(ms));
                        output.send(&text_result(&id, "done", false));
                    });
                    return;
                }
                "crash" => std::process::exit(3),
                _ => handle_tools_call(&id, &name, &arguments),
            }
        }
        "ping" if std::env::var("MOCK_SERVER_NO_PING").is_ok() => {
            make_error(&id, -32601, "Method not found: ping")
        }
        "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
        _ => make_error(&id, -32601, &format!("Method not found: {method}")),
    };
    output.send(&response);
}

fn handle_initialize(id: &Value) -> Value {
    let version = std::env::var("MOCK_SERVER_PROTOCOL_VERSION").unwrap_or_else(|_| "2025-11-25".to_string());
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": "mock-tool-server", "version": "0.1.0" }
        }
    })
}

fn handle_tools_list(id: &Value) -> Value {
    let object = |props: Value| json!({ "type": "object", "properties": props });
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "tools": [
                {
                    "name": "echo",
                    "description": "Returns its arguments",
                    "inputSchema": object(json!({ "text": { "type": "string" } }))
                },
                {
                    "name": "add",
                    "description": "Adds two numbers",
                    "inputSchema": object(json!({
                        "a": { "type": "number" },
                        "b": { "type": "number" }
                    }))
                },
                {
                    "name": "fail",
                    "description": "Always reports a tool error",
                    "inputSchema": object(json!({ "message": { "type": "string" } }))
                },
                {
                    "name": "slow",
                    "description": "Answers after a delay",
                    "inputSchema": object(json!({ "ms": { "type": "integer" } }))
                },
                {
                    "name": "crash",
                    "description": "Terminates the server",
                    "inputSchema": object(json!({}))
                }
            ]
        }
    })
}

fn handle_tools_call(id: &Value, name: &str, arguments: &Value) -> Value {
    match name {
        "echo" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "content": [{ "type": "text", "text": arguments.to_string() }],
                "structuredContent": arguments
            }
        }),
        "add" => {
            let a = arguments.get("a").and_then(Value::as_f64).unwrap_or(0.0);
            let b = arguments.get("b").and_then(Value::as_f64).unwrap_or(0.0);
            text_result(id, &json!({ "sum": a + b }).to_string(), false)
        }
        "fail" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("tool failed");
            text_result(id, message, true)
        }
        _ => make_error(id, -32602, &format!("Unknown tool: {name}")),
    }
}

fn text_result(id: &Value, text: &str, is_error: bool) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "content": [{ "type": "text", "text": text }],
            "isError": is_error
        }
    })
}

fn make_error(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}
