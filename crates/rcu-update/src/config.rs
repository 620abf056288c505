//! Update configuration
//!
//! Settings arrive once at start-up as a JSON object and later one key at a
//! time through [`UpdateConfig::apply_attribute`]. Intervals are expressed in
//! milliseconds on the wire.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{UpdateError, UpdateResult};

/// Scan the configured update directories
pub const LOCATION_UPDATE_DIRS: u8 = 0x1;
/// Scan the server update path
pub const LOCATION_SERVER_PATH: u8 = 0x2;
/// Accept archives from the external push feed
pub const LOCATION_EXTERNAL_PUSH: u8 = 0x4;

const LOCATION_ALL: u8 = LOCATION_UPDATE_DIRS | LOCATION_SERVER_PATH | LOCATION_EXTERNAL_PUSH;

/// Configuration keys
pub mod keys {
    pub const SERVER_UPDATE_PATH: &str = "server_update_path";
    pub const TEMP_PATH: &str = "temp_path";
    pub const IMAGE_POLL_INTERVAL: &str = "image_poll_interval";
    pub const DOWNLOAD_POLL_INTERVAL: &str = "download_poll_interval";
    pub const LOAD_POLL_INTERVAL: &str = "load_poll_interval";
    pub const INTERACTIVE_DOWNLOAD: &str = "interactive_download";
    pub const INTERACTIVE_LOAD: &str = "interactive_load";
    pub const BACKGROUND_DOWNLOAD: &str = "background_download";
    pub const LOAD_IMMEDIATELY: &str = "load_immediately";
    pub const PERCENT_INCREMENT: &str = "percent_increment";
    pub const UPDATE_DIRS: &str = "update_dirs";
    pub const EXTERNAL_PUSH_PATH: &str = "external_push_path";
    pub const LOCATION_CHECK: &str = "location_check";
    pub const SESSION_TIMEOUT: &str = "session_timeout";
    pub const LOAD_INACTIVITY_DELAY: &str = "load_inactivity_delay";
    pub const LOAD_BEFORE_HOUR: &str = "load_before_hour";
}

/// Runtime configuration of the update service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Directory the server drops update archives into
    pub server_update_path: Option<PathBuf>,
    /// Scratch directory for extracted images
    pub temp_path: PathBuf,
    /// How often the image directories are rescanned
    pub image_poll_interval: Duration,
    /// Re-poll delay handed to remotes that cannot start a download yet
    pub download_poll_interval: Duration,
    /// Re-poll delay handed to remotes that cannot load yet
    pub load_poll_interval: Duration,
    /// Downloads wait for explicit initiation
    pub interactive_download: bool,
    /// Loads wait for explicit initiation
    pub interactive_load: bool,
    /// Downloads run in the background by default
    pub background_download: bool,
    /// Remotes load as soon as a download completes
    pub load_immediately: bool,
    /// Progress event granularity, 1..=100
    pub percent_increment: u8,
    /// Local directories scanned for archives
    pub update_dirs: Vec<PathBuf>,
    /// Drop location of the external push feed
    pub external_push_path: Option<PathBuf>,
    /// Which image sources are honoured, see the `LOCATION_*` bits
    pub location_check: u8,
    /// Default session inactivity timeout
    pub session_timeout: Duration,
    /// Inactivity delay before loading under the default policy
    pub load_inactivity_delay: Duration,
    /// Loads are only allowed before this local hour
    pub load_before_hour: Option<u8>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            server_update_path: None,
            temp_path: std::env::temp_dir().join("rcu-update"),
            image_poll_interval: Duration::from_secs(3600),
            download_poll_interval: Duration::from_secs(60),
            load_poll_interval: Duration::from_secs(60),
            interactive_download: false,
            interactive_load: false,
            background_download: true,
            load_immediately: false,
            percent_increment: 25,
            update_dirs: Vec::new(),
            external_push_path: None,
            location_check: LOCATION_ALL,
            session_timeout: Duration::from_secs(30),
            load_inactivity_delay: Duration::from_secs(30),
            load_before_hour: None,
        }
    }
}

impl UpdateConfig {
    /// Load from a JSON object field by field
    ///
    /// A field that fails validation keeps its default and is logged; the rest
    /// of the object still applies.
    pub fn from_json(value: &Value) -> Self {
        let mut config = Self::default();
        let Some(object) = value.as_object() else {
            warn!("Update configuration is not a JSON object, using defaults");
            return config;
        };

        for (key, field) in object {
            if let Err(e) = config.apply_attribute(key, field) {
                warn!("{}", e);
            }
        }
        config
    }

    /// Read and load a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(Self::from_json(&value))
    }

    /// Apply a single configuration key
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ConfigFieldInvalid`] for unknown keys or
    /// invalid values. The current value is left untouched.
    pub fn apply_attribute(&mut self, key: &str, value: &Value) -> UpdateResult<()> {
        match key {
            keys::SERVER_UPDATE_PATH => self.server_update_path = optional_path(key, value)?,
            keys::TEMP_PATH => self.temp_path = path(key, value)?,
            keys::IMAGE_POLL_INTERVAL => {
                let interval = millis(key, value)?;
                if interval.is_zero() {
                    return Err(UpdateError::config_field(key, "must be greater than 0"));
                }
                self.image_poll_interval = interval;
            }
            keys::DOWNLOAD_POLL_INTERVAL => self.download_poll_interval = millis(key, value)?,
            keys::LOAD_POLL_INTERVAL => self.load_poll_interval = millis(key, value)?,
            keys::INTERACTIVE_DOWNLOAD => self.interactive_download = flag(key, value)?,
            keys::INTERACTIVE_LOAD => self.interactive_load = flag(key, value)?,
            keys::BACKGROUND_DOWNLOAD => self.background_download = flag(key, value)?,
            keys::LOAD_IMMEDIATELY => self.load_immediately = flag(key, value)?,
            keys::PERCENT_INCREMENT => {
                let increment = small_uint(key, value, 100)?;
                if increment == 0 {
                    return Err(UpdateError::config_field(key, "must be at least 1"));
                }
                self.percent_increment = increment;
            }
            keys::UPDATE_DIRS => {
                let dirs = value
                    .as_array()
                    .ok_or_else(|| UpdateError::config_field(key, "expected an array of paths"))?;
                self.update_dirs = dirs
                    .iter()
                    .map(|dir| path(key, dir))
                    .collect::<UpdateResult<Vec<_>>>()?;
            }
            keys::EXTERNAL_PUSH_PATH => self.external_push_path = optional_path(key, value)?,
            keys::LOCATION_CHECK => self.location_check = small_uint(key, value, LOCATION_ALL)?,
            keys::SESSION_TIMEOUT => {
                let timeout = millis(key, value)?;
                if timeout.is_zero() {
                    return Err(UpdateError::config_field(key, "must be greater than 0"));
                }
                self.session_timeout = timeout;
            }
            keys::LOAD_INACTIVITY_DELAY => self.load_inactivity_delay = millis(key, value)?,
            keys::LOAD_BEFORE_HOUR => {
                self.load_before_hour = if value.is_null() {
                    None
                } else {
                    Some(small_uint(key, value, 23)?)
                };
            }
            _ => return Err(UpdateError::config_field(key, "unknown key")),
        }
        debug!(key, value = %value, "Applied configuration attribute");
        Ok(())
    }

    /// Validate the whole configuration
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ConfigFieldInvalid`] naming the first bad field.
    pub fn validate(&self) -> UpdateResult<()> {
        if self.percent_increment == 0 || self.percent_increment > 100 {
            return Err(UpdateError::config_field(
                keys::PERCENT_INCREMENT,
                "must be between 1 and 100",
            ));
        }
        if self.session_timeout.is_zero() {
            return Err(UpdateError::config_field(
                keys::SESSION_TIMEOUT,
                "must be greater than 0",
            ));
        }
        if self.image_poll_interval.is_zero() {
            return Err(UpdateError::config_field(
                keys::IMAGE_POLL_INTERVAL,
                "must be greater than 0",
            ));
        }
        if self.location_check & !LOCATION_ALL != 0 {
            return Err(UpdateError::config_field(
                keys::LOCATION_CHECK,
                "unknown location bits",
            ));
        }
        if self.load_before_hour.is_some_and(|hour| hour > 23) {
            return Err(UpdateError::config_field(
                keys::LOAD_BEFORE_HOUR,
                "must be between 0 and 23",
            ));
        }
        Ok(())
    }

    /// Create a configuration builder
    #[must_use]
    pub fn builder() -> UpdateConfigBuilder {
        UpdateConfigBuilder::default()
    }

    /// Directories to scan for archives, honouring `location_check`
    pub fn scan_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        if self.location_check & LOCATION_UPDATE_DIRS != 0 {
            roots.extend(self.update_dirs.iter().cloned());
        }
        if self.location_check & LOCATION_SERVER_PATH != 0
            && let Some(server) = &self.server_update_path
        {
            roots.push(server.clone());
        }
        roots
    }

    /// Whether the external push feed is honoured
    pub fn accepts_external_push(&self) -> bool {
        self.location_check & LOCATION_EXTERNAL_PUSH != 0
    }
}

/// Builder for [`UpdateConfig`]
#[derive(Debug, Default)]
pub struct UpdateConfigBuilder {
    config: UpdateConfig,
}

impl UpdateConfigBuilder {
    #[must_use]
    pub fn temp_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.temp_path = path.into();
        self
    }

    #[must_use]
    pub fn update_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.update_dirs.push(path.into());
        self
    }

    #[must_use]
    pub fn server_update_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.server_update_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn image_poll_interval(mut self, interval: Duration) -> Self {
        self.config.image_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn download_poll_interval(mut self, interval: Duration) -> Self {
        self.config.download_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn load_poll_interval(mut self, interval: Duration) -> Self {
        self.config.load_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn interactive_download(mut self, enabled: bool) -> Self {
        self.config.interactive_download = enabled;
        self
    }

    #[must_use]
    pub fn interactive_load(mut self, enabled: bool) -> Self {
        self.config.interactive_load = enabled;
        self
    }

    #[must_use]
    pub fn background_download(mut self, enabled: bool) -> Self {
        self.config.background_download = enabled;
        self
    }

    #[must_use]
    pub fn load_immediately(mut self, enabled: bool) -> Self {
        self.config.load_immediately = enabled;
        self
    }

    #[must_use]
    pub fn percent_increment(mut self, percent: u8) -> Self {
        self.config.percent_increment = percent;
        self
    }

    #[must_use]
    pub fn location_check(mut self, bits: u8) -> Self {
        self.config.location_check = bits;
        self
    }

    #[must_use]
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    #[must_use]
    pub fn load_inactivity_delay(mut self, delay: Duration) -> Self {
        self.config.load_inactivity_delay = delay;
        self
    }

    #[must_use]
    pub fn load_before_hour(mut self, hour: Option<u8>) -> Self {
        self.config.load_before_hour = hour;
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> UpdateResult<UpdateConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn path(key: &str, value: &Value) -> UpdateResult<PathBuf> {
    match value.as_str() {
        Some(text) if !text.is_empty() => Ok(PathBuf::from(text)),
        _ => Err(UpdateError::config_field(key, "expected a non-empty path")),
    }
}

fn optional_path(key: &str, value: &Value) -> UpdateResult<Option<PathBuf>> {
    if value.is_null() {
        return Ok(None);
    }
    path(key, value).map(Some)
}

fn flag(key: &str, value: &Value) -> UpdateResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| UpdateError::config_field(key, "expected a boolean"))
}

fn millis(key: &str, value: &Value) -> UpdateResult<Duration> {
    value
        .as_u64()
        .map(Duration::from_millis)
        .ok_or_else(|| UpdateError::config_field(key, "expected milliseconds as an unsigned integer"))
}

fn small_uint(key: &str, value: &Value, max: u8) -> UpdateResult<u8> {
    let raw = value
        .as_u64()
        .ok_or_else(|| UpdateError::config_field(key, "expected an unsigned integer"))?;
    u8::try_from(raw)
        .ok()
        .filter(|v| *v <= max)
        .ok_or_else(|| UpdateError::config_field(key, format!("{raw} exceeds {max}")))
}
