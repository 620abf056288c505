//! Common imports for update session users

pub use crate::config::UpdateConfig;
pub use crate::error::{UpdateError, UpdateResult};
pub use crate::events::{SessionResult, UpdateEvent};
pub use crate::load::{LoadInfo, LoadType};
pub use crate::manager::{BeginOutcome, BeginRequest, DownloadStart, LoadStart};
pub use crate::persist::{JsonFileStore, MemoryStore, PendingSession, SessionStore};
pub use crate::service::UpdateService;
pub use crate::session::{ControllerKey, SessionCounters, SessionState};

pub use rcu_image::{
    AudioTheme, Candidate, HardwareVersion, ImageType, SoftwareVersion, UpdateQuery,
};
