//! Session lifecycle management
//!
//! [`SessionManager`] owns the catalog, the session map, the counters and the
//! timeout table. Every mutating call happens on the actor thread; the read
//! path only touches the [`StreamRegistry`] it shares with the manager.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Utc};
use rcu_image::{
    ArchiveInspector, AudioTheme, Candidate, HardwareVersion, ImageCatalog, ImageInfo, ImageScan,
    SoftwareVersion, UpdateQuery, find_best_candidate,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{UpdateConfig, keys};
use crate::error::{UpdateError, UpdateResult};
use crate::events::{EventSink, SessionResult, UpdateEvent};
use crate::load::{self, LOAD_TIMEOUT_MARGIN, LoadInfo, LoadPolicy, LoadType};
use crate::persist::{PendingSession, SessionStore};
use crate::session::{ControllerKey, Session, SessionCounters, SessionFlags, SessionState};
use crate::stream::{SessionStream, StreamRegistry};
use crate::timeout::TimeoutSupervisor;

/// Download polls a parked session may miss before it times out
const PARKED_POLLS_MISSED: u32 = 3;

/// Arguments of [`SessionManager::begin`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeginRequest {
    pub key: ControllerKey,
    pub hardware: HardwareVersion,
    pub bootloader: SoftwareVersion,
    pub software: SoftwareVersion,
    /// Theme the remote reported, replayed when matching on resume
    #[serde(default)]
    pub audio_theme: AudioTheme,
    /// The remote is a Z variant
    #[serde(default)]
    pub type_z: bool,
    pub image_id: usize,
    /// Inactivity timeout, the configured default when `None`
    pub timeout: Option<Duration>,
    pub manual_poll: bool,
    /// Saved state when resuming after a restart
    pub resume: Option<ResumeState>,
}

impl BeginRequest {
    pub fn new(
        key: ControllerKey,
        image_id: usize,
        hardware: HardwareVersion,
        bootloader: SoftwareVersion,
        software: SoftwareVersion,
    ) -> Self {
        Self {
            key,
            hardware,
            bootloader,
            software,
            audio_theme: AudioTheme::INVALID,
            type_z: false,
            image_id,
            timeout: None,
            manual_poll: false,
            resume: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Carry the theme and Z flag from the remote's update query
    #[must_use]
    pub fn with_query(mut self, query: &UpdateQuery) -> Self {
        self.audio_theme = query.audio_theme;
        self.type_z = query.type_z;
        self
    }

    #[must_use]
    pub fn with_manual_poll(mut self, manual_poll: bool) -> Self {
        self.manual_poll = manual_poll;
        self
    }

    #[must_use]
    pub fn with_resume(mut self, resume: ResumeState) -> Self {
        self.resume = Some(resume);
        self
    }
}

/// Session state carried over a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub session_id: u64,
    pub download_initiated: bool,
    pub background_download: bool,
    pub percent_increment: u8,
    pub load_initiated: bool,
    pub load: LoadPolicy,
}

impl From<&PendingSession> for ResumeState {
    fn from(pending: &PendingSession) -> Self {
        Self {
            session_id: pending.session_id,
            download_initiated: pending.download_initiated,
            background_download: pending.background_download,
            percent_increment: pending.percent_increment,
            load_initiated: pending.load_initiated,
            load: pending.load.clone(),
        }
    }
}

/// Answer to [`SessionManager::begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeginOutcome {
    /// The image is staged and the remote may pull
    Ready {
        session_id: u64,
        background_download: bool,
    },
    /// Ask again after `poll_again`
    NotReady { poll_again: Duration },
}

/// Arguments of [`SessionManager::interactive_download_start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStart {
    pub background: bool,
    pub percent_increment: u8,
    pub load_immediately: bool,
}

/// Arguments of [`SessionManager::interactive_load_start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStart {
    pub load_type: LoadType,
    pub time_to_load: Option<DateTime<Utc>>,
    pub time_after_inactive: Duration,
}

/// Owner of all session state
pub struct SessionManager {
    config: UpdateConfig,
    catalog: ImageCatalog,
    sessions: HashMap<ControllerKey, Session>,
    counters: SessionCounters,
    timeouts: TimeoutSupervisor,
    streams: StreamRegistry,
    events: EventSink,
    store: Arc<dyn SessionStore>,
    last_session_id: u64,
    /// Resume queue loaded from the store
    pending: Vec<PendingSession>,
    update_in_progress: bool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("catalog", &self.catalog)
            .field("sessions", &self.sessions.len())
            .field("counters", &self.counters)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager, loading the last session id and resume queue
    pub fn new(
        config: UpdateConfig,
        catalog: ImageCatalog,
        store: Arc<dyn SessionStore>,
        events: EventSink,
        streams: StreamRegistry,
    ) -> Self {
        let last_session_id = store.read_session_id().unwrap_or_else(|e| {
            warn!("Failed to read last session id: {:#}", e);
            0
        });
        let pending = store.read_pending_sessions().unwrap_or_else(|e| {
            warn!("Failed to read pending sessions: {:#}", e);
            Vec::new()
        });
        if !pending.is_empty() {
            info!("Loaded {} pending session(s) for resume", pending.len());
        }

        Self {
            config,
            catalog,
            sessions: HashMap::new(),
            counters: SessionCounters::default(),
            timeouts: TimeoutSupervisor::new(),
            streams,
            events,
            store,
            last_session_id,
            pending,
            update_in_progress: false,
        }
    }

    /// Scan the configured image locations
    pub fn scan_images(&mut self) -> usize {
        let found = self.image_scan().run();
        self.publish_images(found)
    }

    /// Scan of the configured image locations that runs without the manager
    pub fn image_scan(&self) -> ImageScan {
        self.catalog.scan_job(&self.config.scan_roots())
    }

    /// Catalog the result of a detached scan
    pub fn publish_images(&mut self, found: Vec<ImageInfo>) -> usize {
        self.catalog.publish(found)
    }

    /// Start, re-confirm or resume a session
    ///
    /// # Errors
    ///
    /// - [`UpdateError::ImageNotFound`] for an id not in the catalog
    /// - [`UpdateError::SessionBusy`] when both active slots are taken
    /// - I/O and allocation errors from staging; the session is torn down
    pub fn begin(&mut self, request: BeginRequest, now: Instant) -> UpdateResult<BeginOutcome> {
        let key = request.key;
        let image_id = request.image_id;
        let Some(entry) = self.catalog.get(image_id).cloned() else {
            error!("Begin for controller {} with unknown image {}", key, image_id);
            return Err(UpdateError::ImageNotFound(image_id));
        };

        let mut parked = false;
        if let Some(existing) = self.sessions.get(&key) {
            if existing.image_id == image_id {
                if existing.state != SessionState::AwaitingInitiation {
                    debug!(key = %key, image_id, "Session already in progress");
                    return Ok(BeginOutcome::Ready {
                        session_id: existing.session_id,
                        background_download: existing.flags.background_download,
                    });
                }
                if !existing.flags.download_initiated {
                    let timeout = self.parked_timeout(existing);
                    self.timeouts.update(key, timeout, now);
                    return Ok(BeginOutcome::NotReady {
                        poll_again: self.config.download_poll_interval,
                    });
                }
                parked = true;
            } else {
                let previous = existing.image_id;
                info!(
                    "Controller {} switching from image {} to {}",
                    key, previous, image_id
                );
                self.end(key, previous, SessionResult::Aborted)?;
            }
        }

        if !self.counters.has_free_slot() {
            debug!(key = %key, counters = ?self.counters, "Session limit reached");
            return Err(UpdateError::SessionBusy {
                retry_after: self.config.download_poll_interval,
            });
        }

        if parked {
            self.timeouts.destroy(&key);
            if let Some(session) = self.sessions.get_mut(&key) {
                session.counted = true;
                session.holds_slot = true;
            }
            self.counters.add_session();
            self.counters.take_slot();
        } else {
            self.create_session(&request, &entry)?;
            let waiting = self
                .sessions
                .get(&key)
                .is_some_and(|s| s.flags.interactive_download && !s.flags.download_initiated);
            if waiting {
                self.park(&key, now);
                self.persist();
                return Ok(BeginOutcome::NotReady {
                    poll_again: self.config.download_poll_interval,
                });
            }
        }

        self.start_download(key, image_id, request.resume.is_some(), now)
    }

    fn create_session(&mut self, request: &BeginRequest, entry: &ImageInfo) -> UpdateResult<()> {
        let key = request.key;
        self.catalog.acquire(entry.id)?;

        let resume = request.resume.as_ref();
        let session_id = match resume {
            Some(state) => self.adopt_session_id(state.session_id),
            None => self.next_session_id(),
        };
        let background = resume.map_or(self.config.background_download, |r| r.background_download)
            && !request.manual_poll;

        let session = Session {
            key,
            session_id,
            image_id: entry.id,
            image_type: entry.image_type,
            controller_type: entry.controller_type.clone(),
            hardware: request.hardware,
            bootloader: request.bootloader,
            software: request.software,
            audio_theme: request.audio_theme,
            type_z: request.type_z,
            state: SessionState::Staged,
            flags: SessionFlags {
                interactive_download: self.config.interactive_download,
                interactive_load: self.config.interactive_load,
                background_download: background,
                download_initiated: resume.is_some_and(|r| r.download_initiated),
                load_initiated: resume.is_some_and(|r| r.load_initiated),
                manual_poll: request.manual_poll,
                ..SessionFlags::default()
            },
            percent_increment: resume.map_or(self.config.percent_increment, |r| r.percent_increment),
            timeout: request.timeout.unwrap_or(self.config.session_timeout),
            load: resume.map(|r| r.load.clone()).unwrap_or_default(),
            counted: true,
            holds_slot: true,
            holds_image: true,
        };

        self.counters.add_session();
        self.counters.take_slot();
        self.sessions.insert(key, session);
        info!(
            "Session {} created for controller {} with image {} ({} {})",
            session_id, key, entry.id, entry.image_type, entry.version_software
        );
        self.events.emit(UpdateEvent::ReadyToDownload {
            key,
            session_id,
            image_id: entry.id,
        });
        Ok(())
    }

    /// Parked sessions expire once the remote misses a few polls
    fn parked_timeout(&self, session: &Session) -> Duration {
        session.timeout.max(
            self.config
                .download_poll_interval
                .saturating_mul(PARKED_POLLS_MISSED),
        )
    }

    fn park(&mut self, key: &ControllerKey, now: Instant) {
        let Some(session) = self.sessions.get(key) else {
            return;
        };
        let timeout = self.parked_timeout(session);
        self.timeouts.create(*key, timeout, now);

        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        session.state = SessionState::AwaitingInitiation;
        if session.counted {
            session.counted = false;
            self.counters.remove_session();
        }
        if session.holds_slot {
            session.holds_slot = false;
            self.counters.release_slot();
        }
        info!("Session {} parked until download is initiated", session.session_id);
    }

    fn start_download(
        &mut self,
        key: ControllerKey,
        image_id: usize,
        resume: bool,
        now: Instant,
    ) -> UpdateResult<BeginOutcome> {
        if let Err(e) = self.stage_session(key, image_id) {
            error!("Failed to stage image {} for controller {}: {}", image_id, key, e);
            if let Err(end_err) = self.end(key, image_id, SessionResult::Error) {
                warn!("Teardown after staging failure: {}", end_err);
            }
            return Err(e);
        }

        let Some(session) = self.sessions.get(&key) else {
            return Err(UpdateError::session_not_found(key.to_string()));
        };
        let timeout = session.timeout;
        let outcome = BeginOutcome::Ready {
            session_id: session.session_id,
            background_download: session.flags.background_download,
        };
        if !session.flags.background_download {
            self.update_in_progress = true;
        }

        if resume && self.timeouts.is_scheduled(&key) {
            debug!(key = %key, "Keeping timer armed from saved state");
        } else {
            self.timeouts.create(key, timeout, now);
        }

        self.persist();
        Ok(outcome)
    }

    fn stage_session(&mut self, key: ControllerKey, image_id: usize) -> UpdateResult<()> {
        let session = self.session_for(&key, image_id)?;
        if self.streams.lookup(&key, image_id).is_ok() {
            return Ok(());
        }

        let entry = self
            .catalog
            .get(image_id)
            .ok_or(UpdateError::ImageNotFound(image_id))?;
        let path = entry.extracted_path.as_deref().ok_or_else(|| {
            UpdateError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("image {image_id} is not extracted"),
            ))
        })?;

        let stream = SessionStream::open(
            key,
            session.session_id,
            image_id,
            session.percent_increment,
            path,
            entry.size,
        )?;
        self.streams.insert(stream);

        if let Some(session) = self.sessions.get_mut(&key) {
            session.state = SessionState::Staged;
            session.flags.resume_pending = false;
        }
        debug!(key = %key, image_id, "Staged image");
        Ok(())
    }

    /// Stage the session's image on request of the transport
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::SessionNotFound`] for a stale reference, or the
    /// staging error after tearing the session down.
    pub fn stage(&mut self, key: ControllerKey, image_id: usize, now: Instant) -> UpdateResult<()> {
        if let Err(e) = self.stage_session(key, image_id) {
            if !matches!(e, UpdateError::SessionNotFound(_)) {
                error!("Failed to stage image {} for controller {}: {}", image_id, key, e);
                if let Err(end_err) = self.end(key, image_id, SessionResult::Error) {
                    warn!("Teardown after staging failure: {}", end_err);
                }
            }
            return Err(e);
        }
        self.touch(key, None, now);
        Ok(())
    }

    /// Close the session's image and free its windows
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::SessionNotFound`] if nothing is staged.
    pub fn unstage(&mut self, key: ControllerKey, image_id: usize) -> UpdateResult<()> {
        self.streams.lookup(&key, image_id)?;
        if let Some(stream) = self.streams.remove(&key) {
            stream.lock().unstage();
        }
        debug!(key = %key, image_id, "Unstaged image");
        Ok(())
    }

    /// Refill the consumed window
    ///
    /// # Errors
    ///
    /// Returns the read error after tearing the session down.
    pub fn read_next_chunk(&mut self, key: ControllerKey, image_id: usize) -> UpdateResult<()> {
        let stream = self.streams.lookup(&key, image_id)?;
        let result = stream.lock().refill_next();
        self.fail_on_error(key, image_id, result)
    }

    /// Reload both windows around `offset`
    ///
    /// # Errors
    ///
    /// Returns the read error after tearing the session down.
    pub fn reload(&mut self, key: ControllerKey, image_id: usize, offset: u64) -> UpdateResult<()> {
        let stream = self.streams.lookup(&key, image_id)?;
        let result = stream.lock().reload(offset);
        if let Some(session) = self.sessions.get_mut(&key) {
            session.flags.resume_pending = false;
        }
        self.fail_on_error(key, image_id, result)
    }

    fn fail_on_error(
        &mut self,
        key: ControllerKey,
        image_id: usize,
        result: UpdateResult<()>,
    ) -> UpdateResult<()> {
        if let Err(e) = result {
            error!("Read failure for controller {}: {}", key, e);
            if let Err(end_err) = self.end(key, image_id, SessionResult::Error) {
                warn!("Teardown after read failure: {}", end_err);
            }
            return Err(e);
        }
        Ok(())
    }

    /// First bytes reached the remote
    pub fn download_started(&mut self, key: ControllerKey, image_id: usize) {
        let Ok(session) = self.session_for_mut(&key, image_id) else {
            debug!(key = %key, "Download start for a session that is gone");
            return;
        };
        session.state = SessionState::Downloading;
        session.flags.download_in_progress = true;
        session.flags.download_initiated = true;
        info!("Download started for controller {}", key);
    }

    /// Every byte reached the remote; frees one active slot
    pub fn download_complete(&mut self, key: ControllerKey, image_id: usize) {
        let Some(session) = self
            .sessions
            .get_mut(&key)
            .filter(|s| s.image_id == image_id)
        else {
            debug!(key = %key, "Download completion for a session that is gone");
            return;
        };
        session.state = SessionState::LoadWaiting;
        session.flags.download_in_progress = false;
        session.flags.load_waiting = true;
        if session.holds_slot {
            session.holds_slot = false;
            self.counters.release_slot();
        }
        info!("Download complete for controller {}", key);
    }

    /// Re-arm the session timer after remote activity
    pub fn touch(&mut self, key: ControllerKey, timeout_override: Option<Duration>, now: Instant) {
        match self.sessions.get(&key) {
            Some(session) => {
                let timeout = timeout_override.unwrap_or(session.timeout);
                self.timeouts.update(key, timeout, now);
            }
            None => debug!(key = %key, "Activity for controller without a session"),
        }
    }

    /// Decide when the remote should load the downloaded image
    ///
    /// `wall` is local wall-clock time. The session timer is always re-armed
    /// to the answer's delay plus [`LOAD_TIMEOUT_MARGIN`].
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::SessionNotFound`] for a stale reference.
    pub fn load_info(
        &mut self,
        key: ControllerKey,
        image_id: usize,
        wall: DateTime<FixedOffset>,
        now: Instant,
    ) -> UpdateResult<LoadInfo> {
        let session = self.session_for(&key, image_id)?;
        let awaiting = session.flags.interactive_load && !session.flags.load_initiated;
        let answer = load::decide(&session.load, awaiting, &self.config, wall);
        let session_id = session.session_id;

        if answer == LoadInfo::Now {
            self.events.emit(UpdateEvent::LoadBegin { key, session_id });
        }
        self.timeouts
            .update(key, answer.delay().saturating_add(LOAD_TIMEOUT_MARGIN), now);
        debug!(key = %key, answer = ?answer, "Load info");
        Ok(answer)
    }

    /// Release a session parked for interactive download
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::SessionNotFound`] if no session has that id.
    pub fn interactive_download_start(&mut self, session_id: u64, start: DownloadStart) -> UpdateResult<()> {
        let session = self.session_by_id_mut(session_id)?;
        session.flags.download_initiated = true;
        session.flags.background_download = start.background && !session.flags.manual_poll;
        session.percent_increment = start.percent_increment.clamp(1, 100);
        if start.load_immediately {
            session.load.load_type = Some(LoadType::Now);
        }
        info!("Download initiated for session {}", session_id);
        self.persist();
        Ok(())
    }

    /// Release a session waiting for interactive load
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::SessionNotFound`] if no session has that id.
    pub fn interactive_load_start(&mut self, session_id: u64, start: LoadStart) -> UpdateResult<()> {
        let session = self.session_by_id_mut(session_id)?;
        session.flags.load_initiated = true;
        session.load = LoadPolicy {
            load_type: Some(start.load_type),
            time_to_load: start.time_to_load,
            time_after_inactive: start.time_after_inactive,
        };
        info!("Load initiated for session {} ({:?})", session_id, start.load_type);
        self.persist();
        Ok(())
    }

    /// Tear a session down
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::SessionNotFound`] if the controller has no
    /// session for `image_id`.
    pub fn end(&mut self, key: ControllerKey, image_id: usize, result: SessionResult) -> UpdateResult<()> {
        if self.session_for(&key, image_id).is_err() {
            error!("End for unknown session: controller {} image {}", key, image_id);
            return Err(UpdateError::session_not_found(format!(
                "controller {key} image {image_id}"
            )));
        }
        let Some(session) = self.sessions.remove(&key) else {
            return Err(UpdateError::session_not_found(key.to_string()));
        };

        self.events.emit(UpdateEvent::LoadEnd {
            key,
            session_id: session.session_id,
            result,
        });

        if session.counted {
            self.counters.remove_session();
        }
        if session.holds_slot {
            self.counters.release_slot();
        }
        if let Some(stream) = self.streams.remove(&key) {
            stream.lock().unstage();
        }
        if session.holds_image {
            self.catalog.release(image_id);
        }
        self.timeouts.destroy(&key);

        self.update_in_progress = self.sessions.values().any(Session::is_foreground);
        self.persist();

        info!(
            "Session {} for controller {} ended: {:?}",
            session.session_id, key, result
        );
        Ok(())
    }

    /// End every session whose timer is due
    pub fn expire_timeouts(&mut self, now: Instant) -> usize {
        let mut expired = 0usize;
        for key in self.timeouts.take_expired(now) {
            let Some(image_id) = self.sessions.get(&key).map(|s| s.image_id) else {
                debug!(key = %key, "Timer fired without a session");
                continue;
            };
            warn!("Session for controller {} timed out", key);
            match self.end(key, image_id, SessionResult::ErrorTimeout) {
                Ok(()) => expired += 1,
                Err(e) => error!("Timeout teardown failed: {}", e),
            }
        }
        expired
    }

    /// Add an archive delivered by the external push feed
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the feed is disabled, or the
    /// catalog error.
    pub fn process_external_push(&mut self, archive: &Path, explicit_id: Option<usize>) -> UpdateResult<usize> {
        let entry = self.push_inspector(archive, explicit_id)?.inspect(archive)?;
        self.publish_external_push(entry, explicit_id)
    }

    /// Check a push can be accepted and hand out the archive parser
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the feed is disabled, or the
    /// catalog's rejection of `explicit_id`.
    pub fn push_inspector(&self, archive: &Path, explicit_id: Option<usize>) -> UpdateResult<ArchiveInspector> {
        if !self.config.accepts_external_push() {
            warn!("Ignoring external push of {}: feed disabled", archive.display());
            return Err(UpdateError::config_field(
                keys::LOCATION_CHECK,
                "external push is disabled",
            ));
        }
        self.catalog.check_push_target(explicit_id)?;
        Ok(self.catalog.inspector())
    }

    /// Catalog an already parsed push
    ///
    /// # Errors
    ///
    /// Returns the catalog error; the catalog is unchanged.
    pub fn publish_external_push(&mut self, entry: ImageInfo, explicit_id: Option<usize>) -> UpdateResult<usize> {
        Ok(self.catalog.publish_push(entry, explicit_id)?)
    }

    /// Apply a live configuration change
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ConfigFieldInvalid`]; the old value stays.
    pub fn apply_attribute(&mut self, key: &str, value: &Value) -> UpdateResult<()> {
        self.config.apply_attribute(key, value)?;
        if key == keys::TEMP_PATH {
            info!("New temp path takes effect on restart");
        }
        Ok(())
    }

    /// Unstage everything and drop image references before shutdown
    ///
    /// Sessions stay in the store so they resume on the next start.
    pub fn terminate(&mut self) {
        for key in self.streams.keys() {
            if let Some(stream) = self.streams.remove(&key) {
                stream.lock().unstage();
            }
        }
        for session in self.sessions.values_mut() {
            if session.holds_image {
                session.holds_image = false;
                self.catalog.release(session.image_id);
            }
        }
        self.timeouts = TimeoutSupervisor::new();
        self.persist();
        info!("Session manager terminated with {} live session(s)", self.sessions.len());
    }

    fn session_for(&self, key: &ControllerKey, image_id: usize) -> UpdateResult<&Session> {
        self.sessions
            .get(key)
            .filter(|s| s.image_id == image_id)
            .ok_or_else(|| UpdateError::session_not_found(format!("controller {key} image {image_id}")))
    }

    fn session_for_mut(&mut self, key: &ControllerKey, image_id: usize) -> UpdateResult<&mut Session> {
        self.sessions
            .get_mut(key)
            .filter(|s| s.image_id == image_id)
            .ok_or_else(|| UpdateError::session_not_found(format!("controller {key} image {image_id}")))
    }

    fn session_by_id_mut(&mut self, session_id: u64) -> UpdateResult<&mut Session> {
        self.sessions
            .values_mut()
            .find(|s| s.session_id == session_id)
            .ok_or_else(|| {
                error!("No session with id {}", session_id);
                UpdateError::session_not_found(format!("session id {session_id}"))
            })
    }

    fn next_session_id(&mut self) -> u64 {
        self.last_session_id = self.last_session_id.wrapping_add(1);
        self.store_session_id();
        self.last_session_id
    }

    fn adopt_session_id(&mut self, session_id: u64) -> u64 {
        if session_id > self.last_session_id {
            self.last_session_id = session_id;
            self.store_session_id();
        }
        session_id
    }

    fn store_session_id(&self) {
        if let Err(e) = self.store.write_session_id(self.last_session_id) {
            warn!("Failed to persist session id: {:#}", e);
        }
    }

    /// Write live sessions plus the untouched resume queue
    pub(crate) fn persist(&self) {
        let mut list: Vec<PendingSession> = self.sessions.values().map(Session::to_pending).collect();
        list.sort_by_key(|p| p.key);
        list.extend(
            self.pending
                .iter()
                .filter(|p| !self.sessions.contains_key(&p.key))
                .cloned(),
        );
        if let Err(e) = self.store.write_pending_sessions(&list) {
            warn!("Failed to persist pending sessions: {:#}", e);
        }
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingSession> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn restore_pending(&mut self, pending: Vec<PendingSession>) {
        self.pending = pending;
    }

    pub(crate) fn arm_timeout(&mut self, key: ControllerKey, timeout: Duration, now: Instant) {
        self.timeouts.create(key, timeout, now);
    }

    pub(crate) fn cancel_timeout(&mut self, key: &ControllerKey) {
        self.timeouts.destroy(key);
    }

    /// Resume entries not yet picked back up
    pub fn pending(&self) -> &[PendingSession] {
        &self.pending
    }

    /// Snapshot of the controller's session
    pub fn session(&self, key: &ControllerKey) -> Option<Session> {
        let mut session = self.sessions.get(key)?.clone();
        if let Some(stream) = self.streams.get(key) {
            session.flags.resume_pending = stream.lock().resume_pending();
        }
        Some(session)
    }

    pub fn is_controller_updating(&self, key: &ControllerKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Snapshot of a catalog entry
    pub fn image(&self, id: usize) -> Option<ImageInfo> {
        self.catalog.get(id).cloned()
    }

    /// Best image for a remote
    pub fn find_update(&self, query: &UpdateQuery) -> Option<Candidate> {
        find_best_candidate(self.catalog.iter(), query)
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// A foreground session is live
    pub fn is_update_in_progress(&self) -> bool {
        self.update_in_progress
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeouts.next_deadline()
    }

    pub fn timeouts(&self) -> &TimeoutSupervisor {
        &self.timeouts
    }

    pub fn catalog(&self) -> &ImageCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }
}
