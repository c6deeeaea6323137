use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Path of the mock tool server built alongside the tests
#[allow(dead_code)]
pub fn mock_server_path() -> &'static str {
    env!("CARGO_BIN_EXE_mock_tool_server")
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("toolgate.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Configuration with one mock server per id
#[allow(dead_code)]
pub fn mock_config_yaml(ids: &[&str]) -> String {
    let mut yaml = String::from(
        "request_timeout_ms: 5000\nhealth:\n  interval_ms: 60000\nretry:\n  base_delay_ms: 10\n  max_attempts: 2\nservers:\n",
    );
    for id in ids {
        yaml.push_str(&format!(
            "  - id: {id}\n    name: Mock {id}\n    command: \"{}\"\n",
            mock_server_path()
        ));
    }
    yaml
}
