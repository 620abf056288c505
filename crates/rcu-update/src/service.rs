//! Public update service
//!
//! [`UpdateService`] wires the catalog, the session manager and the actor
//! thread together and is the only entry point the transport layer needs.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use parking_lot::RwLock;
use rcu_image::{
    Candidate, Extractor, ImageCatalog, ImageInfo, TagReader, TarGzExtractor, UpdateQuery,
    XmlTagReader,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::actor::{self, Message};
use crate::config::UpdateConfig;
use crate::error::{UpdateError, UpdateResult};
use crate::events::{EventSink, SessionResult, UpdateEvent};
use crate::load::LoadInfo;
use crate::manager::{BeginOutcome, BeginRequest, DownloadStart, LoadStart, SessionManager};
use crate::persist::SessionStore;
use crate::resume::ResumeOptions;
use crate::session::{ControllerKey, Session, SessionCounters};
use crate::stream::StreamRegistry;

/// How long shutdown waits for the actor to acknowledge
pub const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(2);

const ACTOR_THREAD_NAME: &str = "rcu-update-actor";

/// Running update service
pub struct UpdateService {
    manager: Arc<RwLock<SessionManager>>,
    streams: StreamRegistry,
    events: EventSink,
    tx: Option<Sender<Message>>,
    actor: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for UpdateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateService")
            .field("running", &self.tx.is_some())
            .field("staged", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl UpdateService {
    /// Start the service with the default archive and XML handling
    ///
    /// # Errors
    ///
    /// See [`UpdateService::init_with`].
    pub fn init(config: UpdateConfig, store: Arc<dyn SessionStore>) -> UpdateResult<Self> {
        Self::init_with(
            config,
            store,
            Arc::new(TarGzExtractor),
            Arc::new(XmlTagReader),
        )
    }

    /// Start the service
    ///
    /// Validates the configuration, scans the image locations, spawns the
    /// actor thread and queues a resume pass for saved sessions.
    ///
    /// # Errors
    ///
    /// Returns a configuration error, or an I/O error if the temp directory
    /// cannot be created or the actor thread cannot be spawned.
    pub fn init_with(
        config: UpdateConfig,
        store: Arc<dyn SessionStore>,
        extractor: Arc<dyn Extractor>,
        tag_reader: Arc<dyn TagReader>,
    ) -> UpdateResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.temp_path)?;

        let events = EventSink::new();
        let streams = StreamRegistry::new();
        let catalog = ImageCatalog::new(&config.temp_path, extractor, tag_reader);
        let mut manager = SessionManager::new(config, catalog, store, events.clone(), streams.clone());
        let images = manager.scan_images();
        let pending = manager.pending().len();

        let manager = Arc::new(RwLock::new(manager));
        let (tx, rx) = channel::unbounded();
        let actor_manager = Arc::clone(&manager);
        let actor = thread::Builder::new()
            .name(ACTOR_THREAD_NAME.to_string())
            .spawn(move || actor::run(actor_manager, rx))?;

        let service = Self {
            manager,
            streams,
            events,
            tx: Some(tx),
            actor: Some(actor),
        };
        if pending > 0 {
            // Images were scanned above
            service.resume_check_with(ResumeOptions {
                rescan: true,
                just_rebooted: true,
            })?;
        }

        info!(
            "Update service started: {} image(s), {} pending session(s)",
            images, pending
        );
        Ok(service)
    }

    /// Stop the actor
    ///
    /// Queued requests are answered with [`UpdateError::ServiceStopped`].
    /// If the actor does not acknowledge within [`SHUTDOWN_ACK_TIMEOUT`] its
    /// thread is detached rather than joined.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ServiceStopped`] if the actor was already gone.
    pub fn shutdown(&mut self) -> UpdateResult<()> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        info!("Stopping update service");

        let (ack_tx, ack_rx) = channel::bounded(1);
        let sent = tx.send(Message::Terminate { ack: ack_tx });
        drop(tx);
        if sent.is_err() {
            error!("Update actor exited before shutdown");
            self.actor.take();
            return Err(UpdateError::ServiceStopped);
        }

        match ack_rx.recv_timeout(SHUTDOWN_ACK_TIMEOUT) {
            Ok(()) => {
                if let Some(handle) = self.actor.take()
                    && handle.join().is_err()
                {
                    error!("Update actor panicked");
                }
                info!("Update service stopped");
            }
            Err(_timeout) => {
                warn!(
                    "Update actor did not acknowledge shutdown within {:?}, detaching",
                    SHUTDOWN_ACK_TIMEOUT
                );
                self.actor.take();
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    fn post(&self, message: Message) -> UpdateResult<()> {
        self.tx
            .as_ref()
            .ok_or(UpdateError::ServiceStopped)?
            .send(message)
            .map_err(|_closed| UpdateError::ServiceStopped)
    }

    fn request<T>(&self, build: impl FnOnce(actor::Reply<T>) -> Message) -> UpdateResult<T> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.post(build(reply_tx))?;
        reply_rx.recv().map_err(|_closed| UpdateError::ServiceStopped)?
    }

    /// Start or re-confirm a session, see [`SessionManager::begin`]
    ///
    /// # Errors
    ///
    /// See [`SessionManager::begin`].
    pub fn begin(&self, request: BeginRequest) -> UpdateResult<BeginOutcome> {
        self.request(|reply| Message::Begin { request, reply })
    }

    /// # Errors
    ///
    /// See [`SessionManager::end`].
    pub fn end(&self, key: ControllerKey, image_id: usize, result: SessionResult) -> UpdateResult<()> {
        self.request(|reply| Message::End {
            key,
            image_id,
            result,
            reply,
        })
    }

    /// # Errors
    ///
    /// See [`SessionManager::load_info`].
    pub fn load_info(&self, key: ControllerKey, image_id: usize) -> UpdateResult<LoadInfo> {
        self.request(|reply| Message::LoadInfo {
            key,
            image_id,
            reply,
        })
    }

    /// # Errors
    ///
    /// Returns [`UpdateError::SessionNotFound`] if no session has that id.
    pub fn interactive_download_start(&self, session_id: u64, start: DownloadStart) -> UpdateResult<()> {
        self.request(|reply| Message::InteractiveDownloadStart {
            session_id,
            start,
            reply,
        })
    }

    /// # Errors
    ///
    /// Returns [`UpdateError::SessionNotFound`] if no session has that id.
    pub fn interactive_load_start(&self, session_id: u64, start: LoadStart) -> UpdateResult<()> {
        self.request(|reply| Message::InteractiveLoadStart {
            session_id,
            start,
            reply,
        })
    }

    /// Live configuration change
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ConfigFieldInvalid`]; the old value stays.
    pub fn apply_attribute(&self, key: &str, value: Value) -> UpdateResult<()> {
        let key = key.to_string();
        self.request(|reply| Message::ConfigChanged { key, value, reply })
    }

    /// # Errors
    ///
    /// Returns [`UpdateError::ServiceStopped`] if the actor is gone.
    pub fn stage(&self, key: ControllerKey, image_id: usize) -> UpdateResult<()> {
        self.post(Message::Stage { key, image_id })
    }

    /// # Errors
    ///
    /// Returns [`UpdateError::ServiceStopped`] if the actor is gone.
    pub fn unstage(&self, key: ControllerKey, image_id: usize) -> UpdateResult<()> {
        self.post(Message::Unstage { key, image_id })
    }

    /// # Errors
    ///
    /// Returns [`UpdateError::ServiceStopped`] if the actor is gone.
    pub fn read_next_chunk(&self, key: ControllerKey, image_id: usize) -> UpdateResult<()> {
        self.post(Message::ReadNextChunk { key, image_id })
    }

    /// Queue an archive from the external push feed
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ServiceStopped`] if the actor is gone.
    pub fn process_external_push(&self, path: impl Into<PathBuf>, explicit_id: Option<usize>) -> UpdateResult<()> {
        self.post(Message::ProcessExternalPush {
            path: path.into(),
            explicit_id,
        })
    }

    /// Queue a resume pass
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ServiceStopped`] if the actor is gone.
    pub fn resume_check(&self, rescan: bool) -> UpdateResult<()> {
        self.resume_check_with(ResumeOptions {
            rescan,
            just_rebooted: false,
        })
    }

    /// Queue a resume pass with explicit options
    ///
    /// With `just_rebooted` set no rescan happens even if `rescan` asks
    /// for one.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ServiceStopped`] if the actor is gone.
    pub fn resume_check_with(&self, options: ResumeOptions) -> UpdateResult<()> {
        self.post(Message::ResumeCheck { options })
    }

    /// Remote activity; re-arms the session timer
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ServiceStopped`] if the actor is gone.
    pub fn timeout_update_activity(
        &self,
        key: ControllerKey,
        timeout_override: Option<Duration>,
    ) -> UpdateResult<()> {
        self.post(Message::Activity {
            key,
            timeout_override,
        })
    }

    /// Copy image bytes at `offset` into `buf`
    ///
    /// Returns the number of bytes copied, 0 when the windows are being
    /// reloaded and the remote should ask again.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::SessionNotFound`] if the controller has nothing staged
    /// - [`UpdateError::OffsetOutOfRange`] if the range passes the image end
    pub fn image_data_read(
        &self,
        key: ControllerKey,
        image_id: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> UpdateResult<usize> {
        let stream = self.streams.lookup(&key, image_id)?;
        let (outcome, session_id) = {
            let mut stream = stream.lock();
            (stream.read(offset, buf)?, stream.session_id())
        };

        if let Some(percent) = outcome.percent {
            self.events.emit(UpdateEvent::DownloadStatus {
                key,
                session_id,
                percent,
            });
        }
        if outcome.started {
            self.post_quiet(Message::DownloadStarted { key, image_id });
        }
        if let Some(offset) = outcome.reload {
            self.post_quiet(Message::Reload {
                key,
                image_id,
                offset,
            });
        }
        if outcome.refill {
            self.post_quiet(Message::ReadNextChunk { key, image_id });
        }
        if outcome.complete {
            self.post_quiet(Message::DownloadComplete { key, image_id });
        }
        if outcome.copied > 0 {
            self.post_quiet(Message::Activity {
                key,
                timeout_override: None,
            });
        }
        Ok(outcome.copied)
    }

    fn post_quiet(&self, message: Message) {
        if let Err(e) = self.post(message) {
            debug!("Dropping read follow-up: {}", e);
        }
    }

    pub fn is_controller_updating(&self, key: &ControllerKey) -> bool {
        self.manager.read().is_controller_updating(key)
    }

    /// Snapshot of a controller's session
    pub fn session(&self, key: &ControllerKey) -> Option<Session> {
        self.manager.read().session(key)
    }

    pub fn image(&self, id: usize) -> Option<ImageInfo> {
        self.manager.read().image(id)
    }

    /// Best image for a remote, if any
    pub fn find_update(&self, query: &UpdateQuery) -> Option<Candidate> {
        self.manager.read().find_update(query)
    }

    pub fn counters(&self) -> SessionCounters {
        self.manager.read().counters()
    }

    pub fn is_update_in_progress(&self) -> bool {
        self.manager.read().is_update_in_progress()
    }

    /// Current configuration
    pub fn config(&self) -> UpdateConfig {
        self.manager.read().config().clone()
    }
}

impl Drop for UpdateService {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            debug!("Shutdown on drop: {}", e);
        }
    }
}
