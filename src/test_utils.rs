//! Test utilities for toolgate
//!
//! Temporary directories, test files, and ready-made server definitions.

use crate::registry::ServerDefinition;
use std::path::PathBuf;
use tempfile::TempDir;

/// Create a temporary directory for testing
///
/// The directory is removed when the returned `TempDir` is dropped.
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Create a test file with the given content
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn create_test_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// A valid stdio server definition named after its id
///
/// The command is never spawned by tests that use scripted transports.
pub fn stdio_definition(id: &str) -> ServerDefinition {
    ServerDefinition::stdio(id, "cat")
}

/// Assert that an error's message chain contains `expected`
///
/// # Panics
///
/// Panics if the result is Ok or the message does not match.
pub fn assert_error_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, expected: &str) {
    match result {
        Ok(v) => panic!("Expected error containing '{expected}', got Ok({v:?})"),
        Err(e) => {
            let message = format!("{e:#}");
            assert!(
                message.contains(expected),
                "Expected error containing '{expected}', got '{message}'"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_file() {
        let dir = temp_dir();
        let path = create_test_file(&dir, "a.txt", "content");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "content");
    }

    #[test]
    fn test_stdio_definition_is_valid() {
        let def = stdio_definition("local");
        assert_eq!(def.name, "local");
        assert!(def.validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "Expected error")]
    fn test_assert_error_contains_panics_on_ok() {
        assert_error_contains(Ok::<_, anyhow::Error>(1), "x");
    }
}
