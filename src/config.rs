//! # Configuration Module
//!
//! The panel client's own settings: which bus to use, what the daemon is
//! called on it, and where to look for the settings schema. This is separate
//! from the shared settings record in [`crate::store`], which belongs to the
//! daemon.
//!
//! ## Configuration Storage
//! Stored as JSON in:
//! `~/.config/desk-changer-applet/config.json`
//!
//! ## Schema Search Path
//! In order: `$DESK_CHANGER_SCHEMA_DIR`, any `schema_dirs` from the config,
//! `~/.local/share/desk-changer/schemas`, `/usr/share/desk-changer/schemas`,
//! `./schemas`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::Level;

use crate::dbus_client::{BusAddress, INTERFACE_NAME, OBJECT_PATH, SERVICE_NAME};

/// Environment variable that puts one more directory at the front of the
/// schema search path.
pub const SCHEMA_DIR_ENV: &str = "DESK_CHANGER_SCHEMA_DIR";

/// Schema id of the daemon's settings record.
pub const DEFAULT_SCHEMA_ID: &str = "org.gnome.shell.extensions.desk-changer";

/// Client configuration.
///
/// Persisted to `~/.config/desk-changer-applet/config.json` as JSON. Any
/// field missing from the file takes its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// `session`, `system`, or a literal D-Bus address.
    pub bus: BusAddress,
    /// Well-known name of the rotation daemon.
    pub service_name: String,
    pub object_path: String,
    pub interface_name: String,
    /// Id of the settings schema shared with the daemon.
    pub schema_id: String,
    /// Extra schema directories, searched after the environment override.
    pub schema_dirs: Vec<PathBuf>,
    /// `error`, `warn`, `info`, `debug` or `trace`. `LOG_LEVEL` wins over this.
    pub log_level: String,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            bus: BusAddress::Session,
            service_name: SERVICE_NAME.to_string(),
            object_path: OBJECT_PATH.to_string(),
            interface_name: INTERFACE_NAME.to_string(),
            schema_id: DEFAULT_SCHEMA_ID.to_string(),
            schema_dirs: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl PanelConfig {
    /// Returns the path to the configuration file.
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("desk-changer-applet/config.json"))
    }

    /// Loads the configuration from disk.
    ///
    /// If the config file doesn't exist or cannot be parsed, returns default values.
    pub fn load() -> Self {
        Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    /// Like [`load`](Self::load), but on first run writes the defaults out
    /// so there is a file to edit.
    pub fn load_or_init() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_or_init_at(&path),
            None => Self::default(),
        }
    }

    fn load_or_init_at(path: &Path) -> Self {
        if path.exists() {
            return Self::load_from(path);
        }
        let config = Self::default();
        if let Err(e) = config.save_to(path) {
            // Logging is not up yet; it is configured from this file.
            eprintln!("Could not write default config: {e}");
        }
        config
    }

    /// Persists the configuration as pretty-printed JSON, creating the
    /// directory if needed.
    fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))?;

        Ok(())
    }

    /// Directories searched for `<schema_id>.json`, first hit wins.
    pub fn schema_search_path(&self) -> Vec<PathBuf> {
        let env_dir = std::env::var_os(SCHEMA_DIR_ENV).map(PathBuf::from);
        self.search_path_with(env_dir)
    }

    fn search_path_with(&self, env_dir: Option<PathBuf>) -> Vec<PathBuf> {
        let mut path: Vec<PathBuf> = env_dir.into_iter().collect();
        path.extend(self.schema_dirs.iter().cloned());
        if let Some(data) = dirs::data_dir() {
            path.push(data.join("desk-changer/schemas"));
        }
        path.push(PathBuf::from("/usr/share/desk-changer/schemas"));
        path.push(PathBuf::from("schemas"));
        path
    }

    /// The configured log level, or `INFO` if it doesn't parse.
    pub fn log_level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }
}
