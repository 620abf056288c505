//! Session persistence
//!
//! The last issued session id and the list of resumable sessions survive
//! restarts through a [`SessionStore`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rcu_image::{AudioTheme, HardwareVersion, ImageType, SoftwareVersion, UpdateQuery};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::load::LoadPolicy;
use crate::session::ControllerKey;

const SESSION_ID_FILE: &str = "session_id.json";
const PENDING_FILE: &str = "pending_sessions.json";

/// Everything needed to pick an interrupted session back up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSession {
    pub key: ControllerKey,
    pub image_type: ImageType,
    pub controller_type: String,
    pub hardware: HardwareVersion,
    pub bootloader: SoftwareVersion,
    pub software: SoftwareVersion,
    pub audio_theme: AudioTheme,
    pub type_z: bool,
    pub session_id: u64,
    pub image_id: usize,
    pub download_initiated: bool,
    pub background_download: bool,
    pub manual_poll: bool,
    pub percent_increment: u8,
    pub load_initiated: bool,
    pub load: LoadPolicy,
}

impl PendingSession {
    /// Matcher query built from the saved remote versions
    pub fn query(&self) -> UpdateQuery {
        UpdateQuery {
            image_type: self.image_type,
            controller_type: self.controller_type.clone(),
            hardware: self.hardware,
            bootloader: self.bootloader,
            software: self.software,
            audio_theme: self.audio_theme,
            type_z: self.type_z,
        }
    }

    /// Scheduled load time, if one was set
    pub fn time_to_load(&self) -> Option<DateTime<Utc>> {
        self.load.time_to_load
    }
}

/// Key-value store for session state
pub trait SessionStore: Send + Sync {
    /// Last issued session id, 0 when none was ever stored
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn read_session_id(&self) -> anyhow::Result<u64>;

    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn write_session_id(&self, id: u64) -> anyhow::Result<()>;

    /// Saved resumable sessions, empty when none were stored
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or decoded.
    fn read_pending_sessions(&self) -> anyhow::Result<Vec<PendingSession>>;

    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn write_pending_sessions(&self, sessions: &[PendingSession]) -> anyhow::Result<()>;
}

/// JSON files in a directory, written atomically
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open a store rooted at `dir`, creating the directory
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create store directory: {:?}", dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_atomic(&self, name: &str, content: &str) -> anyhow::Result<()> {
        let path = self.dir.join(name);
        let temp_path = path.with_extension("tmp");

        fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write temp file: {:?}", temp_path))?;
        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to rename temp file to target: {:?}", path))?;

        debug!(path = ?path, "Wrote session store file");
        Ok(())
    }

    fn read_optional(&self, name: &str) -> anyhow::Result<Option<String>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("Failed to read file: {:?}", path))
    }
}

impl SessionStore for JsonFileStore {
    fn read_session_id(&self) -> anyhow::Result<u64> {
        match self.read_optional(SESSION_ID_FILE)? {
            Some(text) => serde_json::from_str(&text).context("Failed to decode session id"),
            None => Ok(0),
        }
    }

    fn write_session_id(&self, id: u64) -> anyhow::Result<()> {
        self.write_atomic(SESSION_ID_FILE, &id.to_string())
    }

    fn read_pending_sessions(&self) -> anyhow::Result<Vec<PendingSession>> {
        match self.read_optional(PENDING_FILE)? {
            Some(text) => serde_json::from_str(&text).context("Failed to decode pending sessions"),
            None => Ok(Vec::new()),
        }
    }

    fn write_pending_sessions(&self, sessions: &[PendingSession]) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(sessions)
            .context("Failed to encode pending sessions")?;
        self.write_atomic(PENDING_FILE, &json)
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    session_id: Mutex<u64>,
    pending: Mutex<Vec<PendingSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn read_session_id(&self) -> anyhow::Result<u64> {
        Ok(*self.session_id.lock())
    }

    fn write_session_id(&self, id: u64) -> anyhow::Result<()> {
        *self.session_id.lock() = id;
        Ok(())
    }

    fn read_pending_sessions(&self) -> anyhow::Result<Vec<PendingSession>> {
        Ok(self.pending.lock().clone())
    }

    fn write_pending_sessions(&self, sessions: &[PendingSession]) -> anyhow::Result<()> {
        *self.pending.lock() = sessions.to_vec();
        Ok(())
    }
}
