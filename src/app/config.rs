use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::watch;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdbSettings {
    pub command_path: String,
    pub auto_detect: bool,
    pub refresh_interval_s: u32,
    pub command_timeout_s: u32,
    pub blacklist: Vec<String>,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            auto_detect: false,
            refresh_interval_s: 5,
            command_timeout_s: 10,
            blacklist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    pub address: String,
    pub ws_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            ws_port: 8891,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagingSettings {
    /// Directory holding the staged webapp bundle. Empty means the
    /// platform data dir (`<data>/deskbridge/webapp`).
    pub client_dir: String,
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            client_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlashSettings {
    pub tool_path: String,
    pub extra_args: Vec<String>,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            tool_path: "superbird-flash".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub staging: StagingSettings,
    #[serde(default)]
    pub flash: FlashSettings,
    #[serde(default)]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            server: ServerSettings::default(),
            staging: StagingSettings::default(),
            flash: FlashSettings::default(),
            version: "0.1.0".to_string(),
        }
    }
}

impl AppConfig {
    pub fn staging_dir(&self) -> PathBuf {
        if !self.staging.client_dir.trim().is_empty() {
            return PathBuf::from(self.staging.client_dir.trim());
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("deskbridge")
            .join("webapp")
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DESKBRIDGE_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".deskbridge_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".deskbridge_config.backup.json")
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: AppConfig = serde_json::from_str(&raw).unwrap_or_default();
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    if config.adb.refresh_interval_s < 1 {
        config.adb.refresh_interval_s = 5;
    }
    if config.adb.command_timeout_s < 1 {
        config.adb.command_timeout_s = 10;
    }
    if config.server.ws_port == 0 {
        config.server.ws_port = 8891;
    }
    if config.server.address.trim().is_empty() {
        config.server.address = "127.0.0.1".to_string();
    }
    if config.flash.tool_path.trim().is_empty() {
        config.flash.tool_path = "superbird-flash".to_string();
    }
    config
}

/// Holds the live configuration and fans out changes to subscribers.
/// Consumers that need to react to setting flips (the ADB auto-detect
/// interval, the command blacklist) hold a `watch::Receiver` instead of
/// re-reading ambient global state.
pub struct ConfigStore {
    sender: watch::Sender<AppConfig>,
}

impl ConfigStore {
    pub fn new(config: AppConfig) -> Self {
        let (sender, _) = watch::channel(validate_config(config));
        Self { sender }
    }

    pub fn load() -> Result<Self, AppError> {
        Ok(Self::new(load_config()?))
    }

    pub fn get(&self) -> AppConfig {
        self.sender.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<AppConfig> {
        self.sender.subscribe()
    }

    /// Mutate, validate, persist, then notify watchers.
    pub fn update(
        &self,
        mutate: impl FnOnce(&mut AppConfig),
    ) -> Result<AppConfig, AppError> {
        let mut config = self.sender.borrow().clone();
        mutate(&mut config);
        let config = validate_config(config);
        save_config(&config)?;
        self.sender.send_replace(config.clone());
        Ok(config)
    }

    /// Update without touching disk. Used by tests and embedders that manage
    /// persistence themselves.
    pub fn set_in_memory(&self, mutate: impl FnOnce(&mut AppConfig)) -> AppConfig {
        let mut config = self.sender.borrow().clone();
        mutate(&mut config);
        let config = validate_config(config);
        self.sender.send_replace(config.clone());
        config
    }
}
