//! dep-assigner configuration file handling
//!
//! Loads and manages ~/.config/dep-assigner/config.yaml.

use crate::datastore::{AppConfigStore, Datastore};
use crate::dep::SyncOptions;
use crate::integrations::{RetryConfig, DEFAULT_BASE_URL};
use crate::model::AppConfig;
use crate::{Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// DEP service connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the DEP session token
    #[serde(default = "default_session_token_env")]
    pub session_token_env: String,

    /// Devices requested per fetch/sync page
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_session_token_env() -> String {
    "DEP_SESSION_TOKEN".to_string()
}

fn default_page_limit() -> u32 {
    depapi::DEFAULT_PAGE_LIMIT
}

impl Default for DepSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            session_token_env: default_session_token_env(),
            page_limit: default_page_limit(),
        }
    }
}

/// Backoff for transient DEP page failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Seconds between assigner passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

/// dep-assigner configuration
///
/// The first three fields seed the persisted [`AppConfig`] on startup; the
/// rest configure this process only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignerConfig {
    /// Public base URL devices use to reach the server
    pub server_url: String,

    /// Team newly synced devices are placed into (empty = no team)
    #[serde(default)]
    pub apple_bm_default_team: String,

    /// End-user authentication for hosts with no team
    #[serde(default)]
    pub enable_end_user_authentication: bool,

    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database: PathBuf,

    #[serde(default)]
    pub dep: DepSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub daemon: DaemonSettings,
}

fn config_dir() -> PathBuf {
    // ~/.config on every platform, macOS included
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("dep-assigner");
    path
}

fn default_database_path() -> PathBuf {
    config_dir().join("assigner.db")
}

impl AssignerConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            apple_bm_default_team: String::new(),
            enable_end_user_authentication: false,
            database: default_database_path(),
            dep: DepSettings::default(),
            retry: RetrySettings::default(),
            daemon: DaemonSettings::default(),
        }
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::AssignerError::Config(format!(
                "Config file not found: {} (run `dep-assigner init`)",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            server_url = %config.server_url,
            database = %config.database.display(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Save configuration, replacing the file atomically
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        tracing::info!(path = %path.display(), "Saving configuration");

        let yaml = serde_yaml::to_string(self)?;
        let mut file = tempfile::NamedTempFile::new_in(parent)?;
        file.write_all(yaml.as_bytes())?;
        file.persist(path).map_err(|e| e.error)?;

        Ok(())
    }

    /// ~/.config/dep-assigner/config.yaml
    pub fn default_path() -> PathBuf {
        config_dir().join("config.yaml")
    }

    /// Copy the deployment settings into the persisted app config
    ///
    /// The terms flag is runtime state and is never touched. Returns whether
    /// anything changed.
    pub fn apply_to(&self, app_config: &mut AppConfig) -> bool {
        let before = app_config.clone();
        app_config.server_settings.server_url = self.server_url.clone();
        app_config.mdm.apple_bm_default_team = self.apple_bm_default_team.clone();
        app_config.mdm.macos_setup.enable_end_user_authentication =
            self.enable_end_user_authentication;
        *app_config != before
    }

    /// Apply the deployment settings to the stored app config
    ///
    /// Registered profiles embed the server URL and the no-team end-user
    /// authentication setting, so changing either drops every registered
    /// profile UUID and the next pass defines them again. Returns whether the
    /// app config changed.
    pub async fn seed_store(&self, store: &dyn Datastore) -> Result<bool> {
        let mut app_config = store.app_config().await.context("fetching app config")?;
        let before = app_config.clone();
        if !self.apply_to(&mut app_config) {
            return Ok(false);
        }

        store
            .save_app_config(&app_config)
            .await
            .context("saving app config")?;

        if profile_inputs_changed(&before, &app_config) {
            tracing::info!(
                server_url = %app_config.server_settings.server_url,
                "Profile settings changed, registered profiles will be defined again"
            );
            store
                .clear_profile_registrations()
                .await
                .context("clearing registered profiles")?;
        }
        Ok(true)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            ..RetryConfig::default()
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            limit: self.dep.page_limit,
            retry: self.retry_config(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.daemon.interval_secs)
    }
}

fn profile_inputs_changed(before: &AppConfig, after: &AppConfig) -> bool {
    before.server_settings.server_url != after.server_settings.server_url
        || before.mdm.macos_setup.enable_end_user_authentication
            != after.mdm.macos_setup.enable_end_user_authentication
}
