//! Hot-path session streams
//!
//! A [`SessionStream`] is the part of a session touched by image reads. The
//! read path locks only the stream it reads from; everything it wants done
//! afterwards is returned as a [`ReadOutcome`] for the caller to post to the
//! actor.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{UpdateError, UpdateResult};
use crate::reader::ChunkReader;
use crate::session::ControllerKey;

/// Follow-up work produced by a read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes copied into the caller's buffer
    pub copied: usize,
    /// First successful read of the session
    pub started: bool,
    /// Reload both windows from this aligned offset
    pub reload: Option<u64>,
    /// Refill the consumed window
    pub refill: bool,
    /// Progress milestone reached
    pub percent: Option<u8>,
    /// Every byte has been delivered
    pub complete: bool,
}

/// Read state of one staged session
#[derive(Debug)]
pub struct SessionStream<R = File> {
    key: ControllerKey,
    session_id: u64,
    image_id: usize,
    reader: ChunkReader<R>,
    bytes_read_controller: u64,
    percent_increment: u8,
    percent_next: u16,
    started: bool,
    completed: bool,
    resume_pending: bool,
    refill_pending: bool,
}

impl SessionStream<File> {
    /// Open the image at `path` and stage it
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened or read, or
    /// [`UpdateError::ResourceExhausted`] if buffers cannot be allocated.
    pub fn open(
        key: ControllerKey,
        session_id: u64,
        image_id: usize,
        percent_increment: u8,
        path: &Path,
        size: u64,
    ) -> UpdateResult<Self> {
        let file = File::open(path)?;
        Self::with_source(key, session_id, image_id, percent_increment, file, size)
    }
}

impl<R: std::io::Read + std::io::Seek> SessionStream<R> {
    /// Stage an arbitrary source
    ///
    /// # Errors
    ///
    /// See [`ChunkReader::stage`].
    pub fn with_source(
        key: ControllerKey,
        session_id: u64,
        image_id: usize,
        percent_increment: u8,
        source: R,
        size: u64,
    ) -> UpdateResult<Self> {
        let mut reader = ChunkReader::new();
        reader.stage(source, size)?;
        let percent_increment = percent_increment.clamp(1, 100);
        Ok(Self {
            key,
            session_id,
            image_id,
            reader,
            bytes_read_controller: 0,
            percent_increment,
            percent_next: u16::from(percent_increment),
            started: false,
            completed: false,
            resume_pending: false,
            refill_pending: false,
        })
    }

    /// Serve a read from the windows
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::OffsetOutOfRange`] if the range passes the end
    /// of the image; no state changes in that case.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> UpdateResult<ReadOutcome> {
        let mut outcome = ReadOutcome::default();

        let Some(copied) = self.reader.copy_to(offset, buf)? else {
            if !self.resume_pending {
                let aligned = offset - offset % crate::reader::CHUNK_SIZE as u64;
                debug!(key = %self.key, offset, aligned, "Read outside windows, reloading");
                self.resume_pending = true;
                outcome.reload = Some(aligned);
            }
            return Ok(outcome);
        };
        outcome.copied = copied;
        if copied == 0 {
            return Ok(outcome);
        }

        if !self.started {
            self.started = true;
            outcome.started = true;
        }

        let end = offset.saturating_add(copied as u64);
        if !self.refill_pending && !self.resume_pending && self.reader.needs_refill(end) {
            self.refill_pending = true;
            outcome.refill = true;
        }

        self.bytes_read_controller = self.bytes_read_controller.max(end);
        self.track_progress(&mut outcome);
        Ok(outcome)
    }

    fn track_progress(&mut self, outcome: &mut ReadOutcome) {
        let size = self.reader.size();
        if size == 0 || self.completed {
            return;
        }

        if self.bytes_read_controller >= size {
            self.completed = true;
            outcome.percent = Some(100);
            outcome.complete = true;
            return;
        }

        let percent = u16::try_from(self.bytes_read_controller.saturating_mul(100) / size).unwrap_or(100);
        if percent < 100 && percent >= self.percent_next {
            outcome.percent = u8::try_from(percent).ok();
            while self.percent_next <= percent {
                self.percent_next = self.percent_next.saturating_add(u16::from(self.percent_increment));
            }
        }
    }

    /// Refill the consumed window if a refill was requested
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the image cannot be read.
    pub fn refill_next(&mut self) -> UpdateResult<()> {
        if !self.refill_pending {
            return Ok(());
        }
        self.refill_pending = false;
        self.reader.refill_next()?;
        Ok(())
    }

    /// Reload both windows around `offset`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the image cannot be read.
    pub fn reload(&mut self, offset: u64) -> UpdateResult<()> {
        self.refill_pending = false;
        let aligned = self.reader.reload(offset)?;
        self.resume_pending = false;
        debug!(key = %self.key, aligned, "Reloaded chunk windows");
        Ok(())
    }
}

impl<R> SessionStream<R> {
    /// Close the image and free the windows
    pub fn unstage(&mut self) {
        self.reader.unstage();
        self.refill_pending = false;
        self.resume_pending = false;
    }

    pub fn key(&self) -> ControllerKey {
        self.key
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn image_id(&self) -> usize {
        self.image_id
    }

    /// Highest offset delivered to the remote
    pub fn bytes_read_controller(&self) -> u64 {
        self.bytes_read_controller
    }

    pub fn resume_pending(&self) -> bool {
        self.resume_pending
    }

    pub fn reader(&self) -> &ChunkReader<R> {
        &self.reader
    }
}

/// Shared handle to a session stream
pub type SharedStream = Arc<Mutex<SessionStream>>;

/// Staged streams by controller
///
/// Written by the actor on stage and unstage, read by the hot path.
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<ControllerKey, SharedStream>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stream: SessionStream) {
        let key = stream.key();
        self.streams.write().insert(key, Arc::new(Mutex::new(stream)));
    }

    pub fn remove(&self, key: &ControllerKey) -> Option<SharedStream> {
        self.streams.write().remove(key)
    }

    pub fn get(&self, key: &ControllerKey) -> Option<SharedStream> {
        self.streams.read().get(key).cloned()
    }

    /// Stream for `key` only if it serves `image_id`
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::SessionNotFound`] otherwise.
    pub fn lookup(&self, key: &ControllerKey, image_id: usize) -> UpdateResult<SharedStream> {
        let stream = self
            .get(key)
            .ok_or_else(|| UpdateError::session_not_found(format!("no staged image for {key}")))?;
        if stream.lock().image_id() != image_id {
            return Err(UpdateError::session_not_found(format!(
                "controller {key} is not staged with image {image_id}"
            )));
        }
        Ok(stream)
    }

    pub fn keys(&self) -> Vec<ControllerKey> {
        self.streams.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}
