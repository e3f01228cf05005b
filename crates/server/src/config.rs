use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;
use server_api::DEFAULT_SESSION_TTL_SECONDS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub session_ttl_seconds: i64,
    pub cookie_secure: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8000".into(),
            database_url: "sqlite://./data/taxi.db".into(),
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            cookie_secure: false,
        }
    }
}

/// Longest session lifetime accepted from configuration: ten years.
pub const MAX_SESSION_TTL_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Keys accepted in `server.toml`. Anything absent keeps its default.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    session_ttl_seconds: Option<i64>,
    cookie_secure: Option<bool>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new("server.toml"), |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file, then environment variables; later sources win.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.bind_addr {
                    settings.server_bind = v;
                }
                if let Some(v) = file_cfg.database_url {
                    settings.database_url = v;
                }
                if let Some(v) = file_cfg.session_ttl_seconds.and_then(session_ttl) {
                    settings.session_ttl_seconds = v;
                }
                if let Some(v) = file_cfg.cookie_secure {
                    settings.cookie_secure = v;
                }
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "ignoring unreadable settings file");
            }
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__SESSION_TTL_SECONDS") {
        match v.trim().parse::<i64>() {
            Ok(parsed) => {
                if let Some(ttl) = session_ttl(parsed) {
                    settings.session_ttl_seconds = ttl;
                }
            }
            Err(error) => {
                tracing::warn!(value = %v, %error, "ignoring unparseable APP__SESSION_TTL_SECONDS");
            }
        }
    }

    if let Some(v) = env("APP__COOKIE_SECURE") {
        settings.cookie_secure = matches!(v.trim(), "1" | "true" | "yes");
    }

    settings
}

fn session_ttl(seconds: i64) -> Option<i64> {
    if (1..=MAX_SESSION_TTL_SECONDS).contains(&seconds) {
        Some(seconds)
    } else {
        tracing::warn!(
            seconds,
            max = MAX_SESSION_TTL_SECONDS,
            "ignoring session ttl outside the accepted range"
        );
        None
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
