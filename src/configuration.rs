//! Settings definitions and the loader that turns a TOML config file into
//! Rust's native types.
//!
//! # Description
//!
//! All the tables listed in the spec's External Interfaces section have a
//! matching `struct` here. Secrets (IRC server passwords) are wrapped in
//! [`secrecy::SecretString`] so they don't leak into `Debug` output or logs.

use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub logging_config: LoggingSettings,
    pub dcss: DcssSettings,
    pub webtiles: WebtilesSettings,
    #[serde(default)]
    pub twitch: Option<TwitchSettings>,
    pub db_file: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSettings {
    pub format: String,
    pub datefmt: Option<String>,
    #[serde(default = "default_log_level")]
    pub level: String,
    pub filename: Option<PathBuf>,
    pub max_bytes: Option<u64>,
    pub backup_count: Option<u32>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LoggingSettings {
    /// A rotating file is only meaningful once max_bytes/backup_count are
    /// also given, per the spec's validation note on `logging_config`.
    pub fn validate(&self) -> Result<(), crate::errors::BeemError> {
        if self.filename.is_some() && (self.max_bytes.is_none() || self.backup_count.is_none()) {
            return Err(crate::errors::BeemError::ConfigInvalid(
                "logging_config.filename requires max_bytes and backup_count".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for one knowledge bot reachable on the `dcss` IRC network.
#[derive(Debug, Deserialize)]
pub struct BotSettings {
    pub nick: String,
    /// Patterns recognized as queries for the stats-lookup service (Sequell).
    #[serde(default)]
    pub stats_patterns: Vec<String>,
    /// Patterns recognized as queries for the monster-lookup service (Gretell).
    #[serde(default)]
    pub monster_patterns: Vec<String>,
    /// Patterns recognized as queries for the source-repo lookup service (Cheibriados).
    #[serde(default)]
    pub repo_patterns: Vec<String>,
    /// True for the bot that echoes a caller-supplied prefix (the primary,
    /// relay-capable bot). Only one bot in the table should set this.
    #[serde(default)]
    pub use_relay: bool,
}

#[derive(Debug, Deserialize)]
pub struct DcssSettings {
    pub hostname: String,
    pub port: u16,
    pub nick: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub fake_connect: bool,
    #[serde(default)]
    pub bad_patterns: Vec<String>,
    pub bots: Vec<BotSettings>,
}

#[derive(Debug, Deserialize)]
pub struct WebtilesSettings {
    pub server_url: String,
    pub protocol_version: u32,
    pub username: String,
    pub password: SecretString,
    pub help_text: String,
    pub max_watched_subscribers: usize,
    pub max_game_idle: u64,
    pub game_rewatch_timeout: u64,
    #[serde(default)]
    pub autowatch_enabled: bool,
    #[serde(default)]
    pub min_autowatch_spectators: u64,
    pub greeting_text: Option<String>,
    pub twitch_reminder_text: Option<String>,
    #[serde(default = "default_reminder_period")]
    pub twitch_reminder_period: u64,
    #[serde(default)]
    pub never_watch: Vec<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    pub watch_username: Option<String>,
    pub command_period: u64,
    pub command_limit: usize,
}

fn default_reminder_period() -> u64 {
    3600
}

impl WebtilesSettings {
    /// `watch_username` forces single-user mode, per the spec.
    pub fn single_user_mode(&self) -> bool {
        self.watch_username.is_some()
    }
}

#[derive(Debug, Deserialize)]
pub struct TwitchSettings {
    pub hostname: String,
    pub port: u16,
    pub nick: String,
    pub password: SecretString,
    pub message_limit: u32,
    pub moderator_message_limit: u32,
    pub message_timeout: u64,
    pub max_chat_idle: u64,
    pub request_expire_time: u64,
    pub max_watched_subscribers: usize,
    pub min_idle: u64,
    pub watch_user: Option<String>,
    #[serde(default)]
    pub never_watch: Vec<String>,
    #[serde(default)]
    pub admins: Vec<String>,
}

impl TwitchSettings {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout)
    }
}

/// Compiles the configured regex strings for one bot once at startup, so
/// that the hot path in [`crate::query_router`] never recompiles a pattern.
pub struct CompiledBot {
    pub nick: String,
    pub use_relay: bool,
    pub stats_patterns: Vec<Regex>,
    pub monster_patterns: Vec<Regex>,
    pub repo_patterns: Vec<Regex>,
}

impl CompiledBot {
    pub fn compile(settings: &BotSettings) -> Result<Self, crate::errors::BeemError> {
        let compile_all = |pats: &[String]| -> Result<Vec<Regex>, crate::errors::BeemError> {
            pats.iter()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| crate::errors::BeemError::ConfigInvalid(e.to_string()))
                })
                .collect()
        };
        Ok(CompiledBot {
            nick: settings.nick.clone(),
            use_relay: settings.use_relay,
            stats_patterns: compile_all(&settings.stats_patterns)?,
            monster_patterns: compile_all(&settings.monster_patterns)?,
            repo_patterns: compile_all(&settings.repo_patterns)?,
        })
    }

    pub fn matches(&self, message: &str) -> Option<crate::query_router::QueryKind> {
        if self.stats_patterns.iter().any(|p| p.is_match(message)) {
            return Some(crate::query_router::QueryKind::Stats);
        }
        if self.monster_patterns.iter().any(|p| p.is_match(message)) {
            return Some(crate::query_router::QueryKind::Monster);
        }
        if self.repo_patterns.iter().any(|p| p.is_match(message)) {
            return Some(crate::query_router::QueryKind::Repo);
        }
        None
    }
}

impl Settings {
    /// Loads settings from the given TOML file path.
    pub fn load(path: &std::path::Path) -> Result<Self, crate::errors::BeemError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .build()
            .map_err(|e| crate::errors::BeemError::ConfigInvalid(e.to_string()))?;

        let settings: Settings = settings
            .try_deserialize()
            .map_err(|e| crate::errors::BeemError::ConfigInvalid(e.to_string()))?;

        settings.logging_config.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_requires_rotation_fields_together() {
        let mut logging = LoggingSettings {
            format: "%(message)s".into(),
            datefmt: None,
            level: "info".into(),
            filename: Some(PathBuf::from("/tmp/beem.log")),
            max_bytes: None,
            backup_count: None,
        };
        assert!(logging.validate().is_err());
        logging.max_bytes = Some(1024);
        logging.backup_count = Some(3);
        assert!(logging.validate().is_ok());
    }
}
