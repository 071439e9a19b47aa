use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;
use session_sync::BootstrapOptions;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_url: String,
    pub database_url: String,
    pub access_token: Option<String>,
    pub retry_delay_ms: u64,
    pub one_time_prekey_count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            database_url: "sqlite://./data/bootstrap.db".into(),
            access_token: None,
            retry_delay_ms: 2_000,
            one_time_prekey_count: 500,
        }
    }
}

impl Settings {
    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            one_time_prekey_count: self.one_time_prekey_count,
        }
    }

    fn apply_file(&mut self, raw: &str) {
        let file_cfg = match toml::from_str::<HashMap<String, String>>(raw) {
            Ok(file_cfg) => file_cfg,
            Err(err) => {
                warn!(error = %err, "config: ignoring unreadable settings file");
                return;
            }
        };
        if let Some(v) = file_cfg.get("server_url") {
            self.server_url = v.clone();
        }
        if let Some(v) = file_cfg.get("database_url") {
            self.database_url = v.clone();
        }
        if let Some(v) = file_cfg.get("access_token") {
            self.set_access_token(v);
        }
        if let Some(v) = file_cfg.get("retry_delay_ms") {
            self.set_retry_delay_ms(v);
        }
        if let Some(v) = file_cfg.get("one_time_prekey_count") {
            self.set_one_time_prekey_count(v);
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("APP__SERVER_URL") {
            self.server_url = v;
        }

        if let Some(v) = var("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("APP__DATABASE_URL") {
            self.database_url = v;
        }

        if let Some(v) = var("ACCESS_TOKEN") {
            self.set_access_token(&v);
        }
        if let Some(v) = var("APP__ACCESS_TOKEN") {
            self.set_access_token(&v);
        }

        if let Some(v) = var("APP__RETRY_DELAY_MS") {
            self.set_retry_delay_ms(&v);
        }
        if let Some(v) = var("APP__ONE_TIME_PREKEY_COUNT") {
            self.set_one_time_prekey_count(&v);
        }
    }

    pub fn set_access_token(&mut self, raw: &str) {
        let token = raw.trim();
        self.access_token = (!token.is_empty()).then(|| token.to_string());
    }

    fn set_retry_delay_ms(&mut self, raw: &str) {
        match raw.trim().parse::<u64>() {
            Ok(parsed) => self.retry_delay_ms = parsed,
            Err(_) => warn!(value = raw, "config: ignoring invalid retry_delay_ms"),
        }
    }

    fn set_one_time_prekey_count(&mut self, raw: &str) {
        match raw.trim().parse::<usize>() {
            Ok(parsed) if parsed > 0 => self.one_time_prekey_count = parsed,
            _ => warn!(value = raw, "config: ignoring invalid one_time_prekey_count"),
        }
    }
}

pub fn load_settings(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        settings.apply_file(&raw);
    }
    settings.apply_env(|key| std::env::var(key).ok());

    settings
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
        assert_eq!(normalize_database_url("sqlite:data\\x.db"), "sqlite://data/x.db");
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("  "), Settings::default().database_url);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut settings = Settings::default();
        settings.apply_file(
            r#"
            server_url = "https://keys.example"
            access_token = "from-file"
            retry_delay_ms = "250"
            one_time_prekey_count = "32"
            "#,
        );

        assert_eq!(settings.server_url, "https://keys.example");
        assert_eq!(settings.access_token.as_deref(), Some("from-file"));
        assert_eq!(settings.database_url, Settings::default().database_url);
        assert_eq!(
            settings.bootstrap_options(),
            BootstrapOptions {
                retry_delay: Duration::from_millis(250),
                one_time_prekey_count: 32,
            }
        );
    }

    #[test]
    fn prefixed_env_wins_over_plain_env_and_file() {
        let mut settings = Settings::default();
        settings.apply_file("database_url = \"sqlite://file.db\"");
        settings.apply_env(env_of(&[
            ("DATABASE_URL", "sqlite://plain.db"),
            ("APP__DATABASE_URL", "sqlite://prefixed.db"),
            ("ACCESS_TOKEN", "plain-token"),
        ]));

        assert_eq!(settings.database_url, "sqlite://prefixed.db");
        assert_eq!(settings.access_token.as_deref(), Some("plain-token"));
    }

    #[test]
    fn invalid_values_keep_previous_settings() {
        let mut settings = Settings::default();
        settings.apply_file("not = [valid");
        settings.apply_env(env_of(&[
            ("APP__RETRY_DELAY_MS", "soon"),
            ("APP__ONE_TIME_PREKEY_COUNT", "0"),
            ("APP__ACCESS_TOKEN", "   "),
        ]));

        assert_eq!(settings, Settings::default());
    }
}
