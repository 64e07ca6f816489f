use std::{env, fs};

use serial_test::serial;
use tempfile::TempDir;

use super::load_config;
use super::settings::{PartialSettings, Settings};

const VARS: [&str; 4] = [
    "COURIER_LOGGING__LEVEL",
    "COURIER_QUEUE__GROUP",
    "COURIER_QUEUE__MAX_DELIVERIES",
    "COURIER_STORE__ENTRY_TTL_SECS",
];

fn unset_all() -> Vec<(&'static str, Option<&'static str>)> {
    VARS.iter().map(|v| (*v, None)).collect()
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.logging.level, "info");
    assert_eq!(settings.store.path, None);
    assert_eq!(settings.store.max_entries_per_topic, Some(10_000));
    assert_eq!(settings.store.entry_ttl_secs, None);
    assert_eq!(settings.queue.group, "courier");
    assert_eq!(settings.queue.consumer, None);
    assert_eq!(settings.queue.reclaim_interval_ms, 1_000);
    assert_eq!(settings.queue.reclaim_min_idle_ms, 5_000);
    assert_eq!(settings.queue.max_deliveries, 5);
}

#[test]
fn test_empty_partial_merges_to_defaults() {
    let merged = PartialSettings::default().merge(Settings::default());
    assert_eq!(merged.queue.group, "courier");
    assert_eq!(merged.logging.level, "info");
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("COURIER_LOGGING__LEVEL", Some("debug")),
            ("COURIER_QUEUE__GROUP", Some("billing")),
            ("COURIER_QUEUE__MAX_DELIVERIES", Some("9")),
            ("COURIER_STORE__ENTRY_TTL_SECS", Some("30")),
        ],
        || {
            let cfg = load_config().unwrap();
            assert_eq!(cfg.logging.level, "debug");
            assert_eq!(cfg.queue.group, "billing");
            assert_eq!(cfg.queue.max_deliveries, 9);
            assert_eq!(cfg.store.entry_ttl_secs, Some(30));
            // untouched keys in an overridden section keep their defaults
            assert_eq!(cfg.queue.reclaim_min_idle_ms, 5_000);
            assert_eq!(cfg.store.max_entries_per_topic, Some(10_000));
        },
    );
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    temp_env::with_vars(unset_all(), || {
        let tmp = TempDir::new().expect("create tempdir");
        let orig = env::current_dir().expect("current_dir");
        env::set_current_dir(tmp.path()).expect("set current dir");

        fs::create_dir_all("config").expect("create config dir");
        let toml = r#"
            [store]
            path = "data/courier"

            [queue]
            group = "warehouse"
            consumer = "dock-1"
            reclaim_interval_ms = 250
        "#;
        fs::write("config/default.toml", toml).expect("write config file");

        let cfg = load_config();
        env::set_current_dir(orig).expect("restore cwd");

        let cfg = cfg.expect("load_config failed");
        assert_eq!(cfg.store.path.as_deref(), Some("data/courier"));
        assert_eq!(cfg.queue.group, "warehouse");
        assert_eq!(cfg.queue.consumer.as_deref(), Some("dock-1"));
        assert_eq!(cfg.queue.reclaim_interval_ms, 250);
        assert_eq!(cfg.queue.max_deliveries, 5);
        assert_eq!(cfg.logging.level, "info");
    });
}

#[test]
fn test_store_settings_open_temporary() {
    let store = Settings::default().store.open().unwrap();
    assert!(store.is_empty("anything").unwrap());
}
