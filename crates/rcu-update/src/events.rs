//! Session milestone events

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::session::ControllerKey;

const EVENT_CAPACITY: usize = 256;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionResult {
    Success,
    Error,
    ErrorTimeout,
    /// Replaced by a session for another image
    Aborted,
}

/// Events published to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateEvent {
    /// A session was created and the remote may start pulling
    ReadyToDownload {
        key: ControllerKey,
        session_id: u64,
        image_id: usize,
    },
    /// Download progress milestone
    DownloadStatus {
        key: ControllerKey,
        session_id: u64,
        percent: u8,
    },
    /// The remote was told to load now
    LoadBegin { key: ControllerKey, session_id: u64 },
    /// The session ended
    LoadEnd {
        key: ControllerKey,
        session_id: u64,
        result: SessionResult,
    },
}

/// Broadcast sender shared by the actor and the read path
///
/// Delivery is best effort: events sent with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<UpdateEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: UpdateEvent) {
        debug!(event = ?event, "Publishing update event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
