//! Double-buffered chunk reader
//!
//! Two [`CHUNK_SIZE`] windows cover a contiguous span of the image. Reads are
//! served from memory; when the remote closes in on the end of the filled
//! span the consumed window is refilled with the next slice, and when it
//! jumps elsewhere both windows are reloaded around the new offset.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use crate::error::{UpdateError, UpdateResult};

/// Size of each read-ahead window
pub const CHUNK_SIZE: usize = 2048;

/// A refill is requested once a read ends this close to the filled boundary
pub const CHUNK_THRESHOLD: u64 = 1024;

const CHUNK: u64 = CHUNK_SIZE as u64;

#[derive(Debug, Default)]
struct Window {
    offset: u64,
    data: Vec<u8>,
}

impl Window {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.data.len() as u64)
    }

    fn covers(&self, start: u64, end: u64) -> bool {
        start >= self.offset && end <= self.end()
    }

    fn slice(&self, start: u64, end: u64) -> Option<&[u8]> {
        let from = usize::try_from(start.checked_sub(self.offset)?).ok()?;
        let to = usize::try_from(end.checked_sub(self.offset)?).ok()?;
        self.data.get(from..to)
    }
}

/// Double-buffered reader over an image file
#[derive(Debug)]
pub struct ChunkReader<R = File> {
    source: Option<R>,
    size: u64,
    windows: [Window; 2],
    /// Slot holding the lower offset
    low: usize,
    bytes_read_file: u64,
}

impl<R> Default for ChunkReader<R> {
    fn default() -> Self {
        Self {
            source: None,
            size: 0,
            windows: [Window::default(), Window::default()],
            low: 0,
            bytes_read_file: 0,
        }
    }
}

impl<R: Read + Seek> ChunkReader<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `source` and fill both windows from offset 0
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ResourceExhausted`] if the window buffers cannot
    /// be allocated, or an I/O error if the source cannot be read.
    pub fn stage(&mut self, source: R, size: u64) -> UpdateResult<()> {
        for window in &mut self.windows {
            window.data = Vec::new();
            window
                .data
                .try_reserve_exact(CHUNK_SIZE)
                .map_err(|e| UpdateError::ResourceExhausted(format!("chunk window: {e}")))?;
        }
        self.source = Some(source);
        self.size = size;
        self.load_both(0)
    }

    /// Serve `buf.len()` bytes at `offset`
    ///
    /// Returns `Ok(None)` when the range lies outside both windows.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::OffsetOutOfRange`] if the range passes the end of
    /// the image.
    pub fn copy_to(&self, offset: u64, buf: &mut [u8]) -> UpdateResult<Option<usize>> {
        let length = buf.len();
        let end = offset
            .checked_add(length as u64)
            .filter(|end| *end <= self.size)
            .ok_or(UpdateError::OffsetOutOfRange {
                offset,
                length,
                size: self.size,
            })?;

        let (low, high) = self.ordered();

        let served = if let Some(bytes) = [low, high]
            .into_iter()
            .find(|w| w.covers(offset, end))
            .and_then(|w| w.slice(offset, end))
        {
            buf.copy_from_slice(bytes);
            true
        } else if low.end() == high.offset && offset >= low.offset && end <= high.end() {
            match (low.slice(offset, low.end()), high.slice(high.offset, end)) {
                (Some(first), Some(second)) => {
                    let (head, tail) = buf.split_at_mut(first.len());
                    head.copy_from_slice(first);
                    tail.copy_from_slice(second);
                    true
                }
                _ => false,
            }
        } else {
            false
        };

        Ok(served.then_some(length))
    }

    /// Whether a read ending at `end` should trigger a refill
    pub fn needs_refill(&self, end: u64) -> bool {
        self.bytes_read_file < self.size && end.saturating_add(CHUNK_THRESHOLD) >= self.bytes_read_file
    }

    /// Replace the low window with the next slice after the filled span
    ///
    /// Returns `Ok(false)` at end of file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the source cannot be read.
    pub fn refill_next(&mut self) -> UpdateResult<bool> {
        if self.bytes_read_file >= self.size {
            return Ok(false);
        }
        let offset = self.bytes_read_file;
        let filled = self.fill(self.low, offset)?;
        self.bytes_read_file = offset.saturating_add(filled);
        self.low = 1 - self.low;
        debug!(
            offset,
            bytes_read_file = self.bytes_read_file,
            "Refilled chunk window"
        );
        Ok(true)
    }

    /// Reload both windows from `offset` rounded down to a chunk boundary
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the source cannot be read.
    pub fn reload(&mut self, offset: u64) -> UpdateResult<u64> {
        let aligned = offset - offset % CHUNK;
        self.load_both(aligned)?;
        Ok(aligned)
    }

    fn load_both(&mut self, offset: u64) -> UpdateResult<()> {
        let first = self.fill(0, offset)?;
        let second = self.fill(1, offset.saturating_add(CHUNK))?;
        self.low = 0;
        self.bytes_read_file = offset.saturating_add(first).saturating_add(second);
        Ok(())
    }

    fn fill(&mut self, slot: usize, offset: u64) -> UpdateResult<u64> {
        let [first, second] = &mut self.windows;
        let window = if slot == 0 { first } else { second };
        let source = self.source.as_mut().ok_or_else(|| {
            UpdateError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "reader is not staged",
            ))
        })?;

        let length = self.size.saturating_sub(offset).min(CHUNK);
        window.offset = offset;
        window.data.clear();
        if length > 0 {
            source.seek(SeekFrom::Start(offset))?;
            // Capacity was reserved at stage time
            window.data.resize(usize::try_from(length).unwrap_or(CHUNK_SIZE), 0);
            source.read_exact(&mut window.data)?;
        }
        Ok(length)
    }
}

impl<R> ChunkReader<R> {
    fn ordered(&self) -> (&Window, &Window) {
        let [first, second] = &self.windows;
        if self.low == 0 {
            (first, second)
        } else {
            (second, first)
        }
    }

    /// Close the source and free both buffers
    pub fn unstage(&mut self) {
        self.source = None;
        self.windows = [Window::default(), Window::default()];
        self.low = 0;
        self.bytes_read_file = 0;
    }

    pub fn is_staged(&self) -> bool {
        self.source.is_some()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of the lower window
    pub fn low_offset(&self) -> u64 {
        self.ordered().0.offset
    }

    /// Offset of the higher window
    pub fn high_offset(&self) -> u64 {
        self.ordered().1.offset
    }

    /// End of the span filled from the file
    pub fn bytes_read_file(&self) -> u64 {
        self.bytes_read_file
    }
}
