//! Integration tests for drover-config

use drover_config::domains::logging::LogLevel;
use drover_config::*;
use std::io::Write;
use std::time::Duration;
use temp_env::with_vars;

#[test]
fn test_default_config_validation() {
    let config = DroverConfig::default();
    assert!(config.validate_all().is_ok());
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("DROVER_WORKERS", Some("3")),
        ("DROVER_CONNECT_TIMEOUT_MS", Some("750")),
        ("DROVER_SHUTDOWN_TIMEOUT_MS", Some("250")),
        ("DROVER_LOG_LEVEL", Some("debug")),
        ("DROVER_RENDEZVOUS_DIR", Some("/run/drover")),
    ];

    with_vars(vars, || {
        let loader = ConfigLoader::new();
        let config = loader.from_env().unwrap();

        assert_eq!(config.cluster.workers, 3);
        assert_eq!(config.cluster.connect_timeout, Duration::from_millis(750));
        assert_eq!(config.cluster.shutdown_timeout, Duration::from_millis(250));
        assert_eq!(config.cluster.worker_timeout, Duration::from_millis(5000));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(
            config.cluster.rendezvous_dir(),
            std::path::PathBuf::from("/run/drover")
        );
    });
}

#[test]
fn test_invalid_env_override_rejected() {
    with_vars(vec![("DROVER_WORKERS", Some("many"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(_)));
    });

    with_vars(vec![("DROVER_WORKERS", Some("0"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::DomainError { .. }));
    });
}

#[test]
fn test_yaml_config_serialization() {
    let yaml = DroverConfig::generate_sample();

    // Parse it back
    let parsed: DroverConfig = serde_yaml::from_str(&yaml).unwrap();
    assert!(parsed.validate_all().is_ok());
}

#[test]
fn test_file_config_with_env_override() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
cluster:
  workers: 4
  connect_timeout: 1000
  share_sockets: false

logging:
  level: warn
  format: compact
"#
    )
    .unwrap();

    with_vars(vec![("DROVER_WORKERS", Some("2"))], || {
        let config = ConfigLoader::new().load(Some(file.path())).unwrap();

        assert_eq!(config.cluster.workers, 2);
        assert_eq!(config.cluster.connect_timeout, Duration::from_millis(1000));
        assert!(!config.cluster.share_sockets);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.logging.format, LogFormat::Compact);
    });
}

#[test]
fn test_custom_prefix() {
    with_vars(vec![("MYAPP_WORKERS", Some("5"))], || {
        let config = ConfigLoader::with_prefix("MYAPP").from_env().unwrap();
        assert_eq!(config.cluster.workers, 5);
    });
}
