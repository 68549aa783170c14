//! Integration tests for configuration resolution
//!
//! Covers the resolution priority order (CLI → SCRIBE_CONFIG → user config
//! dir → defaults) and the SCRIBE_API_URL override.
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate SCRIBE_CONFIG or SCRIBE_API_URL are marked with
//! #[serial] so they run sequentially.

use scribe_common::config::{TomlConfig, API_URL_ENV_VAR, CONFIG_ENV_VAR};
use scribe_common::Error;
use serial_test::serial;
use std::env;
use std::path::Path;
use tempfile::TempDir;

fn write_config(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
#[serial]
fn test_cli_path_wins_over_env() {
    let temp_dir = TempDir::new().unwrap();
    let cli = write_config(&temp_dir, "cli.toml", "api_base_url = \"http://cli.test\"\n");
    let from_env = write_config(&temp_dir, "env.toml", "api_base_url = \"http://env.test\"\n");

    env::set_var(CONFIG_ENV_VAR, &from_env);
    env::remove_var(API_URL_ENV_VAR);

    let config = TomlConfig::resolve(Some(&cli)).unwrap();
    assert_eq!(config.api_base_url, "http://cli.test");

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_env_path_used_without_cli() {
    let temp_dir = TempDir::new().unwrap();
    let from_env = write_config(
        &temp_dir,
        "env.toml",
        "api_base_url = \"http://env.test\"\n[poll]\nmax_attempts = 10\n",
    );

    env::set_var(CONFIG_ENV_VAR, &from_env);
    env::remove_var(API_URL_ENV_VAR);

    let config = TomlConfig::resolve(None).unwrap();
    assert_eq!(config.api_base_url, "http://env.test");
    assert_eq!(config.poll.max_attempts, 10);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_api_url_env_overrides_file() {
    let temp_dir = TempDir::new().unwrap();
    let cli = write_config(&temp_dir, "cli.toml", "api_base_url = \"http://cli.test\"\n");

    env::set_var(API_URL_ENV_VAR, "http://override.test");
    let config = TomlConfig::resolve(Some(&cli)).unwrap();
    assert_eq!(config.api_base_url, "http://override.test");

    env::remove_var(API_URL_ENV_VAR);
}

#[test]
#[serial]
fn test_missing_cli_file_is_config_error() {
    env::remove_var(API_URL_ENV_VAR);
    let err = TomlConfig::resolve(Some(Path::new("/nonexistent/scribe.toml"))).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
#[serial]
fn test_invalid_values_rejected_after_resolution() {
    let temp_dir = TempDir::new().unwrap();
    let cli = write_config(&temp_dir, "bad.toml", "[channels]\nhandshake_timeout_ms = 0\n");

    env::remove_var(API_URL_ENV_VAR);
    let err = TomlConfig::resolve(Some(&cli)).unwrap_err();
    assert!(err.to_string().contains("handshake_timeout_ms"));
}
