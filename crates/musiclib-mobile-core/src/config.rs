//! Application configuration management.
//!
//! Settings live in a JSON file under the user's config directory. The
//! backend scripts keep their own shell-style `musiclib.conf`; values found
//! there can be layered on top with [`AppConfig::apply_shell_conf`] so both
//! sides agree on where playlists and mobile state are kept.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, FileSystemError, Result};

const APP_DIR: &str = "musiclib";
const CONFIG_FILE: &str = "mobile.json";
const SHELL_CONF_FILE: &str = "musiclib.conf";

static ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)=(.*)$").expect("valid regex"));

/// Where backend scripts are searched for, and how they are run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptConfig {
    /// Development checkout, searched first.
    pub development_directory: PathBuf,
    /// System-wide install location, searched second.
    pub installed_directory: PathBuf,
    /// Interpreter used to run scripts.
    pub shell: String,
    /// Script implementing the mobile subcommands.
    pub mobile_script: String,
    /// Script that writes a track rating.
    pub rate_script: String,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            development_directory: home_dir().join(APP_DIR).join("bin"),
            installed_directory: PathBuf::from("/usr/lib/musiclib/bin"),
            shell: "bash".to_string(),
            mobile_script: "musiclib_mobile.sh".to_string(),
            rate_script: "musiclib_rate.sh".to_string(),
        }
    }
}

/// Command used to list remote devices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceListingConfig {
    /// Program looked up on `PATH`.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl Default for DeviceListingConfig {
    fn default() -> Self {
        Self {
            program: "kdeconnect-cli".to_string(),
            args: vec!["-l".to_string()],
        }
    }
}

/// Timeouts applied to supervised operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Limit for quick queries such as device scans and status.
    pub quick_query_secs: u64,
    /// Time a process gets to exit after a termination request.
    pub termination_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            quick_query_secs: 10,
            termination_grace_secs: 2,
        }
    }
}

impl TimeoutConfig {
    /// Quick query limit as a [`Duration`].
    pub const fn quick_query(&self) -> Duration {
        Duration::from_secs(self.quick_query_secs)
    }

    /// Termination grace window as a [`Duration`].
    pub const fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the playlists offered for upload.
    pub playlists_directory: PathBuf,
    /// Directory of the player's own playlists, the authoritative source.
    pub source_playlists_directory: PathBuf,
    /// Directory where the backend keeps mobile sync state and markers.
    pub mobile_directory: PathBuf,
    /// Device preferred when the user has not picked one this session.
    pub default_device_id: Option<String>,
    /// Script search and invocation settings.
    pub scripts: ScriptConfig,
    /// Device listing command.
    pub device_listing: DeviceListingConfig,
    /// Operation timeouts.
    pub timeouts: TimeoutConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let root = home_dir().join(APP_DIR);
        Self {
            playlists_directory: root.join("playlists"),
            source_playlists_directory: dirs::config_dir()
                .unwrap_or_else(|| home_dir().join(".config"))
                .join("audacious")
                .join("playlists"),
            mobile_directory: root.join("data").join("mobile"),
            default_device_id: None,
            scripts: ScriptConfig::default(),
            device_listing: DeviceListingConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let config_path = config_file_path();

        if !config_path.exists() {
            debug!("Config file not found, using defaults");
            let config = Self::default();
            if let Err(e) = config.save_to(&config_path) {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to read config file: {e}"),
            })
        })?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;

        info!("Loaded config from {}", path.display());
        debug!(
            "Playlists directory: {}, mobile directory: {}",
            config.playlists_directory.display(),
            config.mobile_directory.display()
        );

        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create config directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to write config file: {e}"),
            })
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Overlay values from the backend's shell configuration.
    ///
    /// Recognized keys are `PLAYLISTS_DIR`, `AUDACIOUS_PLAYLISTS_DIR`,
    /// `MOBILE_DIR` and `DEVICE_ID`. Unknown keys are ignored. Returns the
    /// number of keys applied.
    pub fn apply_shell_conf(&mut self, values: &HashMap<String, String>) -> usize {
        let mut applied = 0;
        let mut path_value = |key: &str| -> Option<PathBuf> {
            let value = values.get(key).filter(|v| !v.is_empty())?;
            applied += 1;
            Some(expand_home(value))
        };

        if let Some(p) = path_value("PLAYLISTS_DIR") {
            self.playlists_directory = p;
        }
        if let Some(p) = path_value("AUDACIOUS_PLAYLISTS_DIR") {
            self.source_playlists_directory = p;
        }
        if let Some(p) = path_value("MOBILE_DIR") {
            self.mobile_directory = p;
        }
        if let Some(id) = values.get("DEVICE_ID").filter(|v| !v.is_empty()) {
            self.default_device_id = Some(id.clone());
            applied += 1;
        }

        debug!("Applied {} values from shell configuration", applied);
        applied
    }

    /// Get the path to the config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

/// Locate the backend's `musiclib.conf`.
///
/// Checks `$MUSICLIB_CONFIG_DIR`, then the XDG config directory, then the
/// legacy `~/musiclib/config` location.
pub fn locate_shell_conf() -> Option<PathBuf> {
    let mut candidates = Vec::with_capacity(3);
    if let Some(dir) = std::env::var_os("MUSICLIB_CONFIG_DIR").filter(|d| !d.is_empty()) {
        candidates.push(PathBuf::from(dir).join(SHELL_CONF_FILE));
    }
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join(APP_DIR).join(SHELL_CONF_FILE));
    }
    candidates.push(home_dir().join(APP_DIR).join("config").join(SHELL_CONF_FILE));

    candidates.into_iter().find(|p| p.is_file())
}

/// Read a shell-style `KEY="value"` file into a map.
pub fn read_shell_conf(path: &Path) -> Result<HashMap<String, String>> {
    let content = fs::read_to_string(path).map_err(|e| Error::read_failed(path, e))?;
    Ok(parse_shell_conf(&content))
}

/// Parse shell-style assignments.
///
/// Blank lines and `#` comments are skipped. Values may be double-quoted,
/// single-quoted or bare; a bare value ends at an inline ` #` comment.
pub fn parse_shell_conf(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            let caps = ASSIGNMENT.captures(trimmed)?;
            let key = caps.get(1)?.as_str().to_string();
            let value = unquote(caps.get(2)?.as_str());
            Some((key, value))
        })
        .collect()
}

fn unquote(raw: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(rest) = raw.strip_prefix(quote) {
            return match rest.find(quote) {
                Some(end) => rest[..end].to_string(),
                None => rest.to_string(),
            };
        }
    }
    match raw.find(" #") {
        Some(idx) => raw[..idx].trim_end().to_string(),
        None => raw.trim_end().to_string(),
    }
}

/// Expand a leading `~` or `$HOME` reference.
fn expand_home(value: &str) -> PathBuf {
    let home = home_dir();
    for prefix in ["${HOME}", "$HOME", "~"] {
        if let Some(rest) = value.strip_prefix(prefix) {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(value)
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home_dir().join(".config"))
        .join(APP_DIR)
        .join(CONFIG_FILE)
}

/// Configuration manager that handles loading and caching config.
pub struct ConfigManager {
    config: AppConfig,
    path: PathBuf,
}

impl ConfigManager {
    /// Load config from the default location and overlay `musiclib.conf` if found.
    pub fn new() -> Result<Self> {
        let mut config = AppConfig::load()?;
        if let Some(conf) = locate_shell_conf() {
            match read_shell_conf(&conf) {
                Ok(values) => {
                    config.apply_shell_conf(&values);
                    info!("Merged backend settings from {}", conf.display());
                }
                Err(e) => warn!("Ignoring unreadable {}: {}", conf.display(), e),
            }
        }
        Ok(Self {
            config,
            path: config_file_path(),
        })
    }

    /// Load config from an explicit file, without the shell overlay.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            AppConfig::load_from(&path)?
        } else {
            AppConfig::default()
        };
        Ok(Self { config, path })
    }

    /// Get a reference to the current configuration.
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Replace the configuration and persist it.
    pub fn update(&mut self, config: AppConfig) -> Result<()> {
        self.config = config;
        self.config.save_to(&self.path)
    }

    /// Remember `device_id` as the default device and persist it.
    pub fn set_default_device(&mut self, device_id: Option<String>) -> Result<()> {
        self.config.default_device_id = device_id;
        self.config.save_to(&self.path)
    }

    /// Reset to default configuration.
    pub fn reset(&mut self) -> Result<()> {
        self.config = AppConfig::default();
        self.config.save_to(&self.path)
    }
}
