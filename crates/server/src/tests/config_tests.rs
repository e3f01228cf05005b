use super::{
    load_settings_from, normalize_database_url, prepare_database_url, Settings,
    MAX_SESSION_TTL_SECONDS,
};

use std::{collections::HashMap, env, fs, path::Path};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn keeps_memory_and_explicit_urls() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("sqlite://./taxi.db"),
        "sqlite://./taxi.db"
    );
    assert_eq!(normalize_database_url("sqlite:taxi.db"), "sqlite://taxi.db");
}

#[test]
fn blank_url_falls_back_to_default() {
    assert_eq!(
        normalize_database_url("   "),
        Settings::default().database_url
    );
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let temp_root = tempfile_root("taxi_server_config_test");
    let db_path = temp_root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.join("data").exists());

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn missing_file_and_env_yield_defaults() {
    let settings = load_settings_from(Path::new("/definitely/not/here.toml"), env_from(&[]));
    assert_eq!(settings, Settings::default());
}

#[test]
fn file_values_are_overridden_by_environment() {
    let temp_root = tempfile_root("taxi_server_settings_test");
    fs::create_dir_all(&temp_root).expect("temp root");
    let path = temp_root.join("server.toml");
    fs::write(
        &path,
        "bind_addr = \"0.0.0.0:9000\"\ndatabase_url = \"sqlite://./file.db\"\nsession_ttl_seconds = 60\n",
    )
    .expect("write settings");

    let settings = load_settings_from(&path, env_from(&[]));
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.database_url, "sqlite://./file.db");
    assert_eq!(settings.session_ttl_seconds, 60);

    let settings = load_settings_from(
        &path,
        env_from(&[
            ("APP__BIND_ADDR", "127.0.0.1:7000"),
            ("DATABASE_URL", "sqlite://./env.db"),
            ("APP__SESSION_TTL_SECONDS", "not-a-number"),
            ("APP__COOKIE_SECURE", "true"),
        ]),
    );
    assert_eq!(settings.server_bind, "127.0.0.1:7000");
    assert_eq!(settings.database_url, "sqlite://./env.db");
    assert_eq!(settings.session_ttl_seconds, 60);
    assert!(settings.cookie_secure);

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn session_ttl_outside_range_keeps_previous_value() {
    for raw in ["0", "-60", "1000000000000000", "99999999999999999999"] {
        let settings = load_settings_from(
            Path::new("/definitely/not/here.toml"),
            env_from(&[("APP__SESSION_TTL_SECONDS", raw)]),
        );
        assert_eq!(
            settings.session_ttl_seconds,
            Settings::default().session_ttl_seconds,
            "{raw}"
        );
    }

    let max = MAX_SESSION_TTL_SECONDS.to_string();
    let settings = load_settings_from(
        Path::new("/definitely/not/here.toml"),
        env_from(&[("APP__SESSION_TTL_SECONDS", max.as_str())]),
    );
    assert_eq!(settings.session_ttl_seconds, MAX_SESSION_TTL_SECONDS);
}

#[test]
fn session_ttl_from_file_is_range_checked() {
    let temp_root = tempfile_root("taxi_server_ttl_test");
    fs::create_dir_all(&temp_root).expect("temp root");
    let path = temp_root.join("server.toml");
    fs::write(&path, "session_ttl_seconds = -1\n").expect("write settings");

    let settings = load_settings_from(&path, env_from(&[]));
    assert_eq!(
        settings.session_ttl_seconds,
        Settings::default().session_ttl_seconds
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile_root("taxi_server_open_test");
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}

fn tempfile_root(prefix: &str) -> std::path::PathBuf {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    env::temp_dir().join(format!("{prefix}_{suffix}"))
}
