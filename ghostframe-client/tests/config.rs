use std::{io::Write, path::PathBuf};

use ghostframe_client::{
    BackendCommand,
    config::{
        ConfigError, MAX_CONFIG_BYTES, SavedClientConfig, load_config_from_path,
        save_config_with_retry,
    },
};

#[test]
fn missing_config_is_not_an_error() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let loaded = load_config_from_path(&dir.path().join("config.json")).expect("load");
    assert_eq!(loaded, None);
}

#[test]
fn saved_config_round_trips_and_replaces_previous() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("nested").join("config.json");

    let first = SavedClientConfig {
        display_name: Some("Alice".to_owned()),
        ..SavedClientConfig::default()
    };
    save_config_with_retry(&path, &first).expect("save first");

    let second = SavedClientConfig {
        display_name: Some("Bob".to_owned()),
        backend: Some(BackendCommand::Dev {
            interpreter: PathBuf::from("python3"),
            script: PathBuf::from("backend/api.py"),
        }),
        backend_args: vec!["--log-level".to_owned(), "debug".to_owned()],
        download_dir: Some(dir.path().join("downloads")),
    };
    save_config_with_retry(&path, &second).expect("save second");

    assert_eq!(load_config_from_path(&path).expect("load"), Some(second));
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn invalid_config_is_not_written() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");
    let config = SavedClientConfig {
        backend: Some(BackendCommand::Packaged {
            binary: PathBuf::new(),
        }),
        ..SavedClientConfig::default()
    };

    let err = save_config_with_retry(&path, &config).expect_err("empty binary path");
    assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    assert!(!path.exists());
}

#[test]
fn load_config_ignores_oversized_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");

    let mut file = std::fs::File::create(&path).expect("create config.json");
    file.write_all(&vec![b'a'; (MAX_CONFIG_BYTES as usize) + 1024])
        .expect("write oversized config.json");
    drop(file);

    let err = load_config_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
}

#[test]
fn corrupt_config_reports_parse_error() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");
    std::fs::write(&path, b"{\"display_name\": ").expect("write corrupt config");

    let err = load_config_from_path(&path).expect_err("corrupt file should error");
    assert!(matches!(err, ConfigError::Parse(_)), "{err}");
}

#[tokio::test]
async fn retrying_save_does_not_stall_the_runtime() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").expect("write blocker");
    let path = blocker.join("config.json");

    let ticks = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let ticker = {
        let ticks = std::sync::Arc::clone(&ticks);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        })
    };

    let config = SavedClientConfig::default();
    let err = tokio::task::spawn_blocking(move || save_config_with_retry(&path, &config))
        .await
        .expect("save task")
        .expect_err("parent is a file");
    ticker.abort();

    assert!(matches!(err, ConfigError::CreateDir(_)), "{err}");
    // Three attempts back off for at least 150ms in total.
    assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) >= 5);
}
