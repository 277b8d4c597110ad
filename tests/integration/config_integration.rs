//! Layered configuration loading through the public loader

use super::test_utils::with_config_env;
use atelier::config::ConfigValidationError;
use atelier::{ConfigLoader, ProviderType};
use std::path::PathBuf;
use tempfile::TempDir;

fn write_global(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("config").join("atelier").join("config.toml");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_defaults_without_any_source() {
    let dir = TempDir::new().unwrap();
    let config = with_config_env(&dir, || ConfigLoader::load(None).unwrap());

    assert_eq!(config.scheduler.max_concurrency, 2);
    assert_eq!(config.scheduler.retry_budget, 3);
    assert_eq!(config.provider.provider_type, ProviderType::Gemini);
    assert_eq!(config.logging.level, "info");
    assert!(config.validate().is_ok());
}

#[test]
fn test_global_file_is_read_from_xdg_config_home() {
    let dir = TempDir::new().unwrap();
    let config = with_config_env(&dir, || {
        let path = write_global(
            &dir,
            "[scheduler]\nmax_concurrency = 5\n\n[logging]\nlevel = \"debug\"\n",
        );
        assert_eq!(ConfigLoader::global_config_path(), Some(path));
        ConfigLoader::load(None).unwrap()
    });

    assert_eq!(config.scheduler.max_concurrency, 5);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_explicit_file_overrides_global_and_env_overrides_both() {
    let dir = TempDir::new().unwrap();
    let config = with_config_env(&dir, || {
        write_global(
            &dir,
            "[scheduler]\nmax_concurrency = 5\nretry_budget = 9\n\n[provider]\nprovider_type = \"seedream\"\n",
        );
        let explicit = dir.path().join("project.toml");
        std::fs::write(&explicit, "[scheduler]\nmax_concurrency = 1\n").unwrap();
        std::env::set_var("ATELIER__SCHEDULER__RETRY_BUDGET", "0");
        std::env::set_var("ATELIER__PROVIDER__ENDPOINT", "http://127.0.0.1:8080");
        ConfigLoader::load(Some(&explicit)).unwrap()
    });

    assert_eq!(config.scheduler.max_concurrency, 1);
    assert_eq!(config.scheduler.retry_budget, 0);
    assert_eq!(config.provider.provider_type, ProviderType::Seedream);
    assert_eq!(config.provider.endpoint(), "http://127.0.0.1:8080");
}

#[test]
fn test_env_overrides_do_not_leak_between_tests() {
    let dir = TempDir::new().unwrap();
    with_config_env(&dir, || {
        std::env::set_var("ATELIER__SCHEDULER__MAX_CONCURRENCY", "7");
        assert_eq!(ConfigLoader::load(None).unwrap().scheduler.max_concurrency, 7);
    });
    let config = with_config_env(&dir, || ConfigLoader::load(None).unwrap());
    assert_eq!(config.scheduler.max_concurrency, 2);
}

#[test]
fn test_missing_explicit_file_fails() {
    let dir = TempDir::new().unwrap();
    let result = with_config_env(&dir, || {
        ConfigLoader::load(Some(&dir.path().join("nowhere.toml")))
    });
    assert!(result.is_err());
}

#[test]
fn test_loaded_config_reports_all_validation_errors() {
    let dir = TempDir::new().unwrap();
    let config = with_config_env(&dir, || {
        write_global(
            &dir,
            r#"
[scheduler]
max_concurrency = 0

[provider]
endpoint = "ftp://example.com"

[logging]
format = "xml"
"#,
        );
        ConfigLoader::load(None).unwrap()
    });

    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 3);
    assert!(errors
        .iter()
        .any(|e| matches!(e, ConfigValidationError::Scheduler(m) if m.contains("max_concurrency"))));
    assert!(errors
        .iter()
        .any(|e| matches!(e, ConfigValidationError::Provider(m) if m.contains("ftp://"))));
    assert!(errors
        .iter()
        .any(|e| matches!(e, ConfigValidationError::Logging(_))));
}

#[test]
fn test_malformed_value_is_a_load_error() {
    let dir = TempDir::new().unwrap();
    let result = with_config_env(&dir, || {
        write_global(&dir, "[scheduler]\nmax_concurrency = \"many\"\n");
        ConfigLoader::load(None)
    });
    assert!(result.is_err());
}
