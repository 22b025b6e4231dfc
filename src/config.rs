use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::CredentialManager;
use crate::message::{ExpungePolicy, Flag, SyncConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Failed to create config directory")]
    CreateDirError,

    #[error("No accounts configured")]
    NoAccounts,

    #[error("Account not found: {0}")]
    AccountNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImapSecurity {
    None,
    StartTLS,
    SSL,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAccount {
    pub name: String,
    pub email: String,
    pub imap_server: String,
    pub imap_port: u16,
    pub imap_security: ImapSecurity,
    pub imap_username: String,
    /// Plain text password. When absent the system keyring is asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap_password: Option<String>,
    #[serde(default = "default_push_folders")]
    pub push_folders: Vec<String>,
}

fn default_push_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}

impl Default for EmailAccount {
    fn default() -> Self {
        Self {
            name: "Default Account".to_string(),
            email: "user@example.com".to_string(),
            imap_server: "imap.example.com".to_string(),
            imap_port: 993,
            imap_security: ImapSecurity::SSL,
            imap_username: "user@example.com".to_string(),
            imap_password: None,
            push_folders: default_push_folders(),
        }
    }
}

impl EmailAccount {
    pub fn get_imap_password(&self, credentials: &CredentialManager) -> Result<String> {
        if let Some(password) = self.imap_password.as_ref().filter(|p| !p.is_empty()) {
            return Ok(password.clone());
        }
        credentials
            .get_password(&self.email, "imap")?
            .with_context(|| format!("No IMAP password stored for {}", self.email))
    }

    pub fn server_settings(&self, credentials: &CredentialManager) -> Result<ServerSettings> {
        Ok(ServerSettings {
            host: self.imap_server.clone(),
            port: self.imap_port,
            security: self.imap_security,
            username: self.imap_username.clone(),
            password: self.get_imap_password(credentials)?,
        })
    }
}

/// Everything needed to log in to the IMAP server.
#[derive(Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub security: ImapSecurity,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub expunge_policy: ExpungePolicy,
    /// Only messages from the last N days are synchronized.
    pub earliest_poll_days: Option<u32>,
    pub sync_remote_deletions: bool,
    pub maximum_auto_download_message_size: u32,
    pub default_visible_limit: u32,
    pub sync_flags: Vec<Flag>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        let mut sync_flags: Vec<Flag> = defaults.sync_flags.into_iter().collect();
        sync_flags.sort_by(|a, b| a.as_imap_str().cmp(b.as_imap_str()));
        Self {
            expunge_policy: defaults.expunge_policy,
            earliest_poll_days: None,
            sync_remote_deletions: defaults.sync_remote_deletions,
            maximum_auto_download_message_size: defaults.maximum_auto_download_message_size,
            default_visible_limit: defaults.default_visible_limit,
            sync_flags,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    pub enabled: bool,
    pub idle_refresh_minutes: u64,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_refresh_minutes: 24,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub accounts: Vec<EmailAccount>,
    #[serde(default)]
    pub default_account: usize,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub push: PushSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

impl Config {
    pub fn default_path() -> String {
        "~/.config/mailsync/config.json".to_string()
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::tilde(path);
        let path = Path::new(expanded.as_ref());

        // If the file doesn't exist, return default config
        if !path.exists() {
            log::debug!("No config at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;

        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let expanded = shellexpand::tilde(path);
        let path = Path::new(expanded.as_ref());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::CreateDirError)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    /// The named account, or the default one when no name is given.
    pub fn get_account(&self, name: Option<&str>) -> Result<&EmailAccount, ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }

        match name {
            Some(name) => self
                .accounts
                .iter()
                .find(|a| a.name == name || a.email == name)
                .ok_or_else(|| ConfigError::AccountNotFound(name.to_string())),
            None => Ok(self
                .accounts
                .get(self.default_account)
                .unwrap_or(&self.accounts[0])),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        self.sync_config_at(Utc::now())
    }

    pub fn sync_config_at(&self, now: DateTime<Utc>) -> SyncConfig {
        let earliest_poll_date: Option<DateTime<FixedOffset>> = self
            .sync
            .earliest_poll_days
            .map(|days| (now - chrono::Duration::days(i64::from(days))).into());

        SyncConfig {
            expunge_policy: self.sync.expunge_policy,
            earliest_poll_date,
            sync_remote_deletions: self.sync.sync_remote_deletions,
            maximum_auto_download_message_size: self.sync.maximum_auto_download_message_size,
            default_visible_limit: self.sync.default_visible_limit,
            sync_flags: self.sync.sync_flags.iter().cloned().collect(),
        }
    }

    pub fn idle_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.push.idle_refresh_minutes.max(1) * 60)
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => PathBuf::from(shellexpand::tilde(path).as_ref()),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mailsync")
                .join("mailsync.db"),
        }
    }
}
