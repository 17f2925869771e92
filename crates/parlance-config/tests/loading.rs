use std::path::Path;

use parlance_config::{load_config, StoreKind};

#[test]
fn load_valid_fixture() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/parlance.yml");
    let config = load_config(&path).expect("should load without error");

    assert_eq!(config.store.kind, StoreKind::Memory);
    assert_eq!(config.supervisors.cluster.concurrency, 2);
    assert_eq!(config.supervisors.installation.concurrency, 4);
    assert_eq!(config.supervisors.backup.poll_seconds, 30);
    // Unspecified sections fall back to defaults.
    assert_eq!(config.supervisors.migration.poll_seconds, 15);
    assert_eq!(config.supervisors.migration.concurrency, 1);
    assert_eq!(config.events.max_burst_workers, 50);
    assert_eq!(config.api.auth_token.as_deref(), Some("local-dev-token"));
    assert_eq!(config.databases.max_installation_weight, 10.0);
}

#[test]
fn missing_file_returns_error() {
    let path = Path::new("/nonexistent/parlance.yml");
    assert!(load_config(path).is_err());
}

#[test]
fn postgres_without_url_is_invalid() {
    let dir = tempdir();
    let path = dir.join("bad.yml");
    std::fs::write(&path, "store:\n  kind: postgres\n").unwrap();
    let err = load_config(&path).unwrap_err();
    assert!(err.to_string().contains("postgres_url"));
    std::fs::remove_file(&path).ok();
}

fn tempdir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("parlance-config-tests");
    std::fs::create_dir_all(&dir).expect("temp dir");
    dir
}
