use crate::domain::models::BtAddr;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_names: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_names: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bt_discovery".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Resolve remote names during device discovery
    #[serde(default = "default_true")]
    pub resolve_names: bool,
    /// BlueZ adapter to use ("hci0", ...); the system default when unset
    #[serde(default)]
    pub adapter_name: Option<String>,
    /// How long a device inquiry listens before completing
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,
    /// Upper bound for resolving a single device's name
    #[serde(default = "default_name_timeout_ms")]
    pub name_timeout_ms: u64,
    /// Service class searched by the CLI's service phase
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default)]
    pub known_addresses: Vec<BtAddr>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            resolve_names: default_true(),
            adapter_name: None,
            scan_duration_ms: default_scan_duration_ms(),
            name_timeout_ms: default_name_timeout_ms(),
            service_uuid: default_service_uuid(),
            known_addresses: Vec::new(),
        }
    }
}

// 8 inquiry units of 1.28s, the usual classic inquiry length
fn default_scan_duration_ms() -> u64 {
    10_240
}
fn default_name_timeout_ms() -> u64 {
    5_000
}
fn default_service_uuid() -> String {
    // Serial Port Profile
    "00001101-0000-1000-8000-00805f9b34fb".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({:#})", e);
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BtDiscovery");
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)
            .with_context(|| format!("Failed to write {}", self.settings_path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    /// Remember an address; saves only when it was not known yet
    pub fn add_known_address(&mut self, address: BtAddr) -> anyhow::Result<bool> {
        let known = &mut self.settings.discovery.known_addresses;
        if known.contains(&address) {
            return Ok(false);
        }
        known.push(address);
        self.save()?;
        Ok(true)
    }
}
