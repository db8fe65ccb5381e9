use edge_scheduler_core::config::*;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_default_config() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());

    assert_eq!(config.scheduler.max_history_master_tasks, 2000);
    assert_eq!(config.scheduler.max_active_tasks, 200);
    assert_eq!(config.scheduler.allowed_max_tasks_in_db, 300_000);
    assert_eq!(config.log_collect.reserved_bytes, 200 * 1024 * 1024);
    assert_eq!(config.pools.len(), 2);
    assert!(config.pools.iter().any(|p| p.id == DUMP_SINGLE_NODE_LOG
        && p.max_concurrency == 16
        && p.max_capacity == 512));
}

#[test]
fn test_config_from_toml() {
    let toml_content = r#"
[database]
url = "sqlite::memory:"
max_connections = 1
min_connections = 1

[scheduler]
max_active_tasks = 8
update_timeout_ms = 1500

[[pools]]
id = "dumpMultiNodesLog"
max_concurrency = 1
max_capacity = 2

[log_collect]
temp_dir = "/tmp/edge/temp"
public_dir = "/tmp/edge/public"
reserved_rate = 0.1

[observability]
log_level = "debug"
log_format = "json"
metrics_listen_addr = "127.0.0.1:9100"
"#;

    let config = AppConfig::from_toml(toml_content).unwrap();
    assert!(config.database.is_memory());
    assert_eq!(config.scheduler.max_active_tasks, 8);
    assert_eq!(config.scheduler.max_history_master_tasks, 2000);
    assert_eq!(
        config.scheduler.to_spec().update_timeout,
        Duration::from_millis(1500)
    );
    assert_eq!(config.pools.len(), 1);
    assert_eq!(config.log_collect.max_dir_entries, 4096);
    assert_eq!(config.observability.log_format, "json");
}

#[test]
fn test_invalid_configs_rejected() {
    let duplicate_pools = r#"
[[pools]]
id = "p"
max_concurrency = 1
max_capacity = 0

[[pools]]
id = "p"
max_concurrency = 2
max_capacity = 0
"#;
    assert!(AppConfig::from_toml(duplicate_pools).is_err());

    let bad_level = r#"
[observability]
log_level = "loud"
"#;
    assert!(AppConfig::from_toml(bad_level).is_err());

    let relative_dir = r#"
[log_collect]
temp_dir = "relative/temp"
"#;
    assert!(AppConfig::from_toml(relative_dir).is_err());

    let mut config = AppConfig::default();
    config.database.url = "postgres://localhost/db".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[scheduler]\nmax_history_master_tasks = 5\n\n[database]\nurl = \"sqlite::memory:\""
    )
    .unwrap();

    let config = AppConfig::load(file.path().to_str()).unwrap();

    assert_eq!(config.scheduler.max_history_master_tasks, 5);
}

#[test]
fn test_load_missing_file_fails() {
    assert!(AppConfig::load(Some("/nonexistent/edge-scheduler.toml")).is_err());
}

#[test]
fn test_toml_round_trip_keeps_pools() {
    let config = AppConfig::default();
    let text = config.to_toml().unwrap();
    let restored = AppConfig::from_toml(&text).unwrap();
    assert_eq!(restored.pools, config.pools);
}

#[test]
fn test_shipped_config_matches_defaults() {
    let shipped =
        AppConfig::from_toml(include_str!("../../../config/edge-scheduler.toml")).unwrap();
    let defaults = AppConfig::default();

    assert_eq!(shipped.database.url, defaults.database.url);
    assert_eq!(shipped.database.max_connections, defaults.database.max_connections);
    assert_eq!(shipped.database.min_connections, defaults.database.min_connections);
    assert_eq!(
        shipped.database.connection_timeout_seconds,
        defaults.database.connection_timeout_seconds
    );
    assert_eq!(shipped.database.idle_timeout_seconds, defaults.database.idle_timeout_seconds);
    assert_eq!(shipped.pools, defaults.pools);
    assert_eq!(shipped.scheduler.to_spec(), defaults.scheduler.to_spec());
    assert_eq!(shipped.log_collect.upload_max_size, defaults.log_collect.upload_max_size);
    assert_eq!(shipped.observability.log_format, "json");
}
