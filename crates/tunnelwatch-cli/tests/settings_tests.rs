//! Settings store tests

use tempfile::TempDir;
use tunnelwatch_cli::{Settings, SettingsStore, SETTINGS_VERSION};

fn setup() -> (TempDir, SettingsStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = SettingsStore::with_path(temp_dir.path().join("nested").join("settings.json"));
    (temp_dir, store)
}

fn read_json(store: &SettingsStore) -> serde_json::Value {
    let raw = std::fs::read_to_string(store.path()).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn test_missing_file_gives_defaults() {
    let (_temp, store) = setup();

    let settings = store.load().unwrap();

    assert_eq!(settings, Settings::default());
    // Loading alone never creates the file
    assert!(!store.path().exists());
}

#[test]
fn test_save_and_load() {
    let (_temp, store) = setup();

    let mut settings = Settings::default();
    settings.tunnel.token = "2abc".to_string();
    settings.tunnel.region = "eu".to_string();
    settings.tunnel.subdomain = Some("printer".to_string());
    settings.tunnel.auth_name = "octo".to_string();
    settings.tunnel.auth_pass = "correct horse".to_string();
    settings.local_port = 8080;
    settings.public_port = Some(443);

    store.save(&settings).unwrap();
    let loaded = store.load().unwrap();

    assert_eq!(loaded, settings);
}

#[test]
fn test_password_is_not_stored_in_plain_text() {
    let (_temp, store) = setup();

    let mut settings = Settings::default();
    settings.tunnel.auth_pass = "hunter2".to_string();
    store.save(&settings).unwrap();

    let raw = std::fs::read_to_string(store.path()).unwrap();
    assert!(!raw.contains("hunter2"));

    let json = read_json(&store);
    assert_eq!(json["settings_version"], SETTINGS_VERSION);
    assert_ne!(json["auth_pass"], "hunter2");
}

#[test]
fn test_legacy_file_is_migrated() {
    let (_temp, store) = setup();
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(
        store.path(),
        r#"{"token": "2abc", "region": "us", "auth_name": "octo", "auth_pass": "hunter2"}"#,
    )
    .unwrap();

    let settings = store.load().unwrap();
    assert_eq!(settings.tunnel.auth_pass, "hunter2");
    assert_eq!(settings.tunnel.token, "2abc");
    assert_eq!(settings.local_port, 5000);
    assert!(settings.tunnel.auto_connect);

    // Written back once in the current format
    let json = read_json(&store);
    assert_eq!(json["settings_version"], SETTINGS_VERSION);
    assert_ne!(json["auth_pass"], "hunter2");

    // Later loads decode the migrated value
    assert_eq!(store.load().unwrap().tunnel.auth_pass, "hunter2");
}

#[test]
fn test_version_one_file_is_migrated() {
    let (_temp, store) = setup();
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(
        store.path(),
        r#"{"token": "2abc", "auth_pass": "p@ss:word", "settings_version": 1}"#,
    )
    .unwrap();

    assert_eq!(store.load().unwrap().tunnel.auth_pass, "p@ss:word");
    assert_eq!(read_json(&store)["settings_version"], SETTINGS_VERSION);
}

#[test]
fn test_current_file_is_not_rewritten() {
    let (_temp, store) = setup();
    let mut settings = Settings::default();
    settings.tunnel.auth_pass = "secret".to_string();
    store.save(&settings).unwrap();
    let before = std::fs::read_to_string(store.path()).unwrap();

    store.load().unwrap();

    assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
}

#[test]
fn test_invalid_file_is_an_error() {
    let (_temp, store) = setup();
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(store.path(), "{ not json").unwrap();

    let err = store.load().unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse settings file"));
}
