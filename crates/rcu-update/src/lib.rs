//! Update session management for RCU over-the-air updates
//!
//! This crate brokers image downloads to paired remotes:
//! - Session lifecycle with a hard cap on concurrently downloading remotes
//! - Double-buffered chunk streaming that survives out-of-order resumes
//! - Per-session inactivity timeouts
//! - Load scheduling (now, at a time, or after inactivity)
//! - Persistence and resume of in-flight sessions across restarts
//!
//! # Architecture
//!
//! All state changes run on one actor thread fed by a message queue. Image
//! reads bypass the queue and lock only the stream of the session they read.
//!
//! - [`service`]: [`UpdateService`], the public entry point
//! - [`manager`]: [`SessionManager`], the lifecycle state machine
//! - [`reader`]: [`ChunkReader`], the double-buffered window
//! - [`stream`]: Hot-path session streams and their registry
//! - [`timeout`]: [`TimeoutSupervisor`]
//! - [`resume`]: Restart of saved sessions
//! - [`load`]: Load scheduling
//! - [`persist`]: [`SessionStore`] and its implementations
//! - [`config`]: [`UpdateConfig`]
//! - [`events`]: [`UpdateEvent`] broadcast
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rcu_update::prelude::*;
//!
//! # fn example() -> Result<(), UpdateError> {
//! let config = UpdateConfig::builder()
//!     .update_dir("/opt/rcu/updates")
//!     .temp_path("/tmp/rcu-update")
//!     .build()?;
//! let mut service = UpdateService::init(config, Arc::new(MemoryStore::new()))?;
//!
//! let key = ControllerKey::new(1, 4);
//! let request = BeginRequest::new(
//!     key,
//!     0,
//!     HardwareVersion::new(2, 3, 1, 0),
//!     SoftwareVersion::new(1, 0, 0, 0),
//!     SoftwareVersion::new(1, 9, 9, 9),
//! );
//! if let BeginOutcome::Ready { .. } = service.begin(request)? {
//!     let mut chunk = [0u8; 64];
//!     let read = service.image_data_read(key, 0, 0, &mut chunk)?;
//!     println!("read {read} bytes");
//! }
//! service.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod actor;
pub mod config;
pub mod error;
pub mod events;
pub mod load;
pub mod logging;
pub mod manager;
pub mod persist;
pub mod prelude;
pub mod reader;
pub mod resume;
pub mod service;
pub mod session;
pub mod stream;
pub mod timeout;

#[cfg(test)]
mod test_support;

pub use config::UpdateConfig;
pub use error::{UpdateError, UpdateResult};
pub use events::{EventSink, SessionResult, UpdateEvent};
pub use load::{LoadInfo, LoadPolicy, LoadType};
pub use manager::{BeginOutcome, BeginRequest, DownloadStart, LoadStart, ResumeState, SessionManager};
pub use persist::{JsonFileStore, MemoryStore, PendingSession, SessionStore};
pub use reader::{CHUNK_SIZE, CHUNK_THRESHOLD, ChunkReader};
pub use resume::{ResumeOptions, ResumeReport, resume_pending};
pub use service::UpdateService;
pub use session::{ControllerKey, MAX_ACTIVE_SESSIONS, Session, SessionCounters, SessionState};
pub use stream::{SessionStream, StreamRegistry};
pub use timeout::TimeoutSupervisor;
