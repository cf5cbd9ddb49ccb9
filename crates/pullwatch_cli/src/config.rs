//! Configuration file support for pullwatch.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. Environment variables (prefixed with `PULLWATCH_`)
//! 2. Local config file (./pullwatch.toml)
//! 3. XDG config file (~/.config/pullwatch/config.toml)
//! 4. Built-in defaults
//!
//! Example config file:
//! ```toml
//! [[servers]]
//! label = "github"
//! api_base = "https://api.github.com"
//! token = "ghp_..."
//!
//! [[servers]]
//! label = "work"
//! api_base = "https://github.example.com/api/v3"
//! token = "..."
//!
//! [sync]
//! merge_handling = "keep-mine"     # keep-mine | keep-all | discard
//! close_handling = "keep-mine"
//! show_labels = true
//! show_statuses = true
//! label_refresh_interval = 4
//! status_refresh_interval = 10
//! staleness_minutes = 60
//! repo_check_hours = 2
//! hide_new_repositories = false
//! dont_keep_my_merges = false
//! rate_limit_rps = 10
//! ```
//!
//! With no servers configured, a default github.com entry is created from
//! the `PULLWATCH_GITHUB_TOKEN` environment variable.

use std::path::PathBuf;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;

use pullwatch::{HandlingPolicy, Server, Settings};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream API servers.
    pub servers: Vec<ServerConfig>,
    /// Sync engine tunables.
    pub sync: SyncConfig,
}

/// One upstream server entry.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Display label.
    pub label: String,
    /// API base path, e.g. `https://api.github.com` or a GitHub Enterprise
    /// `https://host/api/v3`.
    pub api_base: String,
    /// Personal access token.
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            label: "github".to_string(),
            api_base: "https://api.github.com".to_string(),
            token: None,
        }
    }
}

/// Sync engine tunables, mirroring [`Settings`].
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub merge_handling: String,
    pub close_handling: String,
    pub show_labels: bool,
    pub show_statuses: bool,
    pub label_refresh_interval: u32,
    pub status_refresh_interval: u32,
    pub staleness_minutes: i64,
    pub repo_check_hours: i64,
    pub hide_new_repositories: bool,
    pub dont_keep_my_merges: bool,
    /// Proactive pacing budget; 0 disables the limiter.
    pub rate_limit_rps: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            merge_handling: "keep-mine".to_string(),
            close_handling: "keep-mine".to_string(),
            show_labels: false,
            show_statuses: false,
            label_refresh_interval: 4,
            status_refresh_interval: 10,
            staleness_minutes: 60,
            repo_check_hours: 2,
            hide_new_repositories: false,
            dont_keep_my_merges: false,
            rate_limit_rps: 10,
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Some(proj_dirs) = ProjectDirs::from("", "", "pullwatch") {
            let xdg_config = proj_dirs.config_dir().join("config.toml");
            if xdg_config.exists() {
                tracing::debug!("loading config from {:?}", xdg_config);
                builder = builder.add_source(
                    File::from(xdg_config)
                        .format(FileFormat::Toml)
                        .required(false),
                );
            }
        }

        let local_config = PathBuf::from("pullwatch.toml");
        if local_config.exists() {
            tracing::debug!("loading config from ./pullwatch.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("PULLWATCH")
                .separator("__")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("failed to build config: {}", e);
                Config::default()
            }
        }
    }

    /// Build the configured servers.
    ///
    /// Falls back to a single github.com entry authenticated from
    /// `PULLWATCH_GITHUB_TOKEN` when no servers are configured.
    pub fn servers(&self) -> Vec<Server> {
        if self.servers.is_empty() {
            let token = std::env::var("PULLWATCH_GITHUB_TOKEN").ok();
            let fallback = ServerConfig::default();
            return vec![Server::new(fallback.label, fallback.api_base, token)];
        }
        self.servers
            .iter()
            .map(|s| Server::new(s.label.clone(), s.api_base.clone(), s.token.clone()))
            .collect()
    }

    /// Map the sync section onto engine settings.
    pub fn settings(&self) -> Result<Settings, String> {
        Ok(Settings {
            merge_handling: self.sync.merge_handling.parse::<HandlingPolicy>()?,
            close_handling: self.sync.close_handling.parse::<HandlingPolicy>()?,
            show_labels: self.sync.show_labels,
            show_statuses: self.sync.show_statuses,
            label_refresh_interval: self.sync.label_refresh_interval,
            status_refresh_interval: self.sync.status_refresh_interval,
            staleness_window: chrono::Duration::minutes(self.sync.staleness_minutes),
            new_repo_check_period: chrono::Duration::hours(self.sync.repo_check_hours),
            hide_new_repositories: self.sync.hide_new_repositories,
            dont_keep_my_merges: self.sync.dont_keep_my_merges,
        })
    }

    /// Get the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pullwatch").map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
