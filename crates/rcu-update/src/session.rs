//! Session records and counters

use std::fmt;
use std::time::Duration;

use rcu_image::{AudioTheme, HardwareVersion, ImageType, SoftwareVersion};
use serde::{Deserialize, Serialize};

use crate::load::LoadPolicy;
use crate::persist::PendingSession;

/// Maximum sessions that may be downloading at once
pub const MAX_ACTIVE_SESSIONS: u32 = 2;

/// Identifies a paired remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerKey {
    /// Network the remote is paired on
    pub network_id: u8,
    /// Controller index within the network
    pub controller_id: u8,
}

impl ControllerKey {
    /// Create a new key
    pub fn new(network_id: u8, controller_id: u8) -> Self {
        Self {
            network_id,
            controller_id,
        }
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_id, self.controller_id)
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Parked until the download is explicitly initiated
    AwaitingInitiation,
    /// Image open and both windows filled
    Staged,
    /// The remote is pulling chunks
    Downloading,
    /// All bytes delivered, waiting for the remote to load
    LoadWaiting,
    /// Torn down
    Ended,
}

/// Per-session behaviour flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    /// Download waits for [`interactive_download_start`](crate::UpdateService::interactive_download_start)
    pub interactive_download: bool,
    /// Load waits for [`interactive_load_start`](crate::UpdateService::interactive_load_start)
    pub interactive_load: bool,
    /// Download runs without user-visible progress
    pub background_download: bool,
    pub download_initiated: bool,
    pub download_in_progress: bool,
    pub load_waiting: bool,
    pub load_initiated: bool,
    /// A reload of the read windows is queued
    pub resume_pending: bool,
    /// The remote polled manually; never background
    pub manual_poll: bool,
}

/// One controller's update session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: ControllerKey,
    pub session_id: u64,
    pub image_id: usize,
    pub image_type: ImageType,
    pub controller_type: String,
    pub hardware: HardwareVersion,
    pub bootloader: SoftwareVersion,
    pub software: SoftwareVersion,
    pub audio_theme: AudioTheme,
    pub type_z: bool,
    pub state: SessionState,
    pub flags: SessionFlags,
    /// Progress event granularity in percent
    pub percent_increment: u8,
    /// Inactivity timeout
    pub timeout: Duration,
    pub load: LoadPolicy,
    /// Counted in the session and link counters
    pub counted: bool,
    /// Holds one of the [`MAX_ACTIVE_SESSIONS`] slots
    pub holds_slot: bool,
    /// Holds a catalog reader reference
    pub holds_image: bool,
}

impl Session {
    /// Foreground sessions suppress other update activity
    pub fn is_foreground(&self) -> bool {
        !self.flags.background_download && self.state != SessionState::AwaitingInitiation
    }

    /// Resume descriptor for this session
    pub fn to_pending(&self) -> PendingSession {
        PendingSession {
            key: self.key,
            image_type: self.image_type,
            controller_type: self.controller_type.clone(),
            hardware: self.hardware,
            bootloader: self.bootloader,
            software: self.software,
            audio_theme: self.audio_theme,
            type_z: self.type_z,
            session_id: self.session_id,
            image_id: self.image_id,
            download_initiated: self.flags.download_initiated,
            background_download: self.flags.background_download,
            manual_poll: self.flags.manual_poll,
            percent_increment: self.percent_increment,
            load_initiated: self.flags.load_initiated,
            load: self.load.clone(),
        }
    }
}

/// Global session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    /// Sessions of any link type
    pub session_count: u32,
    /// Sessions over RF4CE
    pub rf4ce_session_count: u32,
    /// RF4CE sessions still downloading
    pub rf4ce_session_active_count: u32,
}

impl SessionCounters {
    pub(crate) fn add_session(&mut self) {
        self.session_count = self.session_count.saturating_add(1);
        self.rf4ce_session_count = self.rf4ce_session_count.saturating_add(1);
    }

    pub(crate) fn remove_session(&mut self) {
        self.session_count = self.session_count.saturating_sub(1);
        self.rf4ce_session_count = self.rf4ce_session_count.saturating_sub(1);
    }

    pub(crate) fn take_slot(&mut self) {
        self.rf4ce_session_active_count = self.rf4ce_session_active_count.saturating_add(1);
    }

    pub(crate) fn release_slot(&mut self) {
        self.rf4ce_session_active_count = self.rf4ce_session_active_count.saturating_sub(1);
    }

    /// Whether another session may start downloading
    pub fn has_free_slot(&self) -> bool {
        self.rf4ce_session_active_count < MAX_ACTIVE_SESSIONS
    }
}
