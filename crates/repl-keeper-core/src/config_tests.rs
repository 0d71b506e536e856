//! Tests for configuration loading and validation.

use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_defaults_are_valid() {
    let config = AdminConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.parallelism, 4);
    assert_eq!(config.retry_policy().max_attempts, 5);
    assert_eq!(config.store_timeout(), Duration::from_secs(10));
}

#[test]
fn test_retry_policy_built_from_settings() {
    let config = AdminConfig {
        retry: RetrySettings {
            max_attempts: 2,
            initial_delay_ms: 50,
            max_delay_ms: 400,
            backoff_multiplier: 3.0,
            jitter_percent: 0.0,
        },
        ..AdminConfig::default()
    };

    let policy = config.retry_policy();
    assert_eq!(policy.total_attempts(), 3);
    assert_eq!(policy.calculate_delay(1), Duration::from_millis(150));
    assert_eq!(policy.calculate_delay(5), Duration::from_millis(400));
}

#[test]
fn test_validation_rejects_bad_values() {
    let cases = [
        AdminConfig {
            number_of_shards: Some(0),
            ..AdminConfig::default()
        },
        AdminConfig {
            parallelism: 0,
            ..AdminConfig::default()
        },
        AdminConfig {
            pool_size: 0,
            ..AdminConfig::default()
        },
        AdminConfig {
            store_timeout_ms: 0,
            ..AdminConfig::default()
        },
        AdminConfig {
            retry: RetrySettings {
                backoff_multiplier: 0.5,
                ..RetrySettings::default()
            },
            ..AdminConfig::default()
        },
    ];

    for config in cases {
        assert!(
            matches!(config.validate(), Err(AdminError::InvalidConfiguration { .. })),
            "expected rejection of {:?}",
            config
        );
    }
}

#[test]
fn test_require_shards() {
    assert!(AdminConfig::default().require_shards().is_err());

    let config = AdminConfig {
        number_of_shards: Some(16),
        ..AdminConfig::default()
    };
    assert_eq!(config.require_shards().unwrap(), 16);
}

/// File and environment layering are checked in one test because the
/// environment is process-wide.
#[test]
fn test_load_layers_file_then_environment() {
    let mut file = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        file,
        "number_of_shards = 64\nparallelism = 2\n\n[retry]\nmax_attempts = 9\n"
    )
    .unwrap();

    std::env::set_var("REPL_KEEPER__PARALLELISM", "6");
    let loaded = AdminConfig::load(Some(file.path()));
    std::env::remove_var("REPL_KEEPER__PARALLELISM");
    let config = loaded.unwrap();

    assert_eq!(config.number_of_shards, Some(64));
    assert_eq!(config.parallelism, 6);
    assert_eq!(config.retry.max_attempts, 9);
    assert_eq!(config.retry.initial_delay_ms, 100);
    assert_eq!(config.pool_size, AdminConfig::default().pool_size);

    let missing = AdminConfig::load(Some(Path::new("/nonexistent/repl-keeper.toml")));
    assert!(matches!(
        missing,
        Err(AdminError::InvalidConfiguration { .. })
    ));
}
