//! Image catalog
//!
//! Owns every update image discovered by directory scans or delivered by the
//! external push feed. Entry ids are catalog positions and never change once
//! assigned; only an explicit-id push may replace an entry, and never while a
//! session is reading it.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::archive::{self, Extractor};
use crate::descriptor::{TagReader, parse_descriptor};
use crate::error::{ImageError, ImageResult};
use crate::image::ImageInfo;

const SCAN_SCRATCH_DIR: &str = "scan";

/// Empty slots an explicit-id push may open past the end of the catalog
pub const MAX_CATALOG_GAP: usize = 256;

/// Parses archives into catalog entries without touching the catalog
///
/// Cloned out of the catalog so extraction can run while the catalog stays
/// readable.
#[derive(Clone)]
pub struct ArchiveInspector {
    temp_root: PathBuf,
    extractor: Arc<dyn Extractor>,
    tag_reader: Arc<dyn TagReader>,
}

impl std::fmt::Debug for ArchiveInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveInspector")
            .field("temp_root", &self.temp_root)
            .finish_non_exhaustive()
    }
}

impl ArchiveInspector {
    /// Extract, parse and validate one archive
    ///
    /// The returned entry has id 0 until the catalog publishes it.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::DescriptorInvalid`] or an I/O error if the
    /// archive cannot be extracted or its descriptor fails validation.
    pub fn inspect(&self, archive: &Path) -> ImageResult<ImageInfo> {
        let scratch = self
            .temp_root
            .join(SCAN_SCRATCH_DIR)
            .join(archive::archive_stem(archive));
        let result = self.read_archive_descriptor(archive, &scratch);
        if let Err(e) = fs::remove_dir_all(&scratch) {
            debug!("Scratch cleanup of {} failed: {}", scratch.display(), e);
        }
        archive::remove_empty_dirs(&self.temp_root.join(SCAN_SCRATCH_DIR), &self.temp_root);
        result
    }

    fn read_archive_descriptor(&self, archive: &Path, scratch: &Path) -> ImageResult<ImageInfo> {
        self.extractor.extract(archive, scratch)?;

        let descriptor_path = archive::find_descriptor(scratch)?
            .ok_or_else(|| ImageError::descriptor_invalid(archive, "no .xml descriptor"))?;
        let xml = fs::read_to_string(&descriptor_path)?;
        let descriptor = parse_descriptor(&xml, self.tag_reader.as_ref(), archive)?;

        let image_path = scratch.join(&descriptor.file_name);
        let actual_size = fs::metadata(&image_path)
            .map_err(|e| {
                ImageError::descriptor_invalid(
                    archive,
                    format!("image file '{}': {e}", descriptor.file_name),
                )
            })?
            .len();
        if actual_size != descriptor.size {
            return Err(ImageError::descriptor_invalid(
                archive,
                format!(
                    "image file is {actual_size} bytes, descriptor says {}",
                    descriptor.size
                ),
            ));
        }

        let (controller_type, type_z) = ImageInfo::split_device_name(&descriptor.device_name);

        Ok(ImageInfo {
            id: 0,
            device_name: descriptor.device_name,
            controller_type,
            image_type: descriptor.image_type,
            version_software: descriptor.version,
            version_bootloader_min: descriptor.bootloader_min,
            version_hardware_min: descriptor.hardware_min,
            size: descriptor.size,
            crc: descriptor.crc,
            force_update: descriptor.force_update,
            suppress_immediate_load: descriptor.suppress_immediate_load,
            audio_theme: descriptor.audio_theme,
            type_z,
            reader_count: 0,
            archive_path: archive.to_path_buf(),
            file_name: descriptor.file_name,
            extracted_path: None,
        })
    }
}

/// Directory scan detached from the catalog
///
/// Built by [`ImageCatalog::scan_job`], run without holding the catalog, and
/// handed back to [`ImageCatalog::publish`].
#[derive(Debug)]
pub struct ImageScan {
    roots: Vec<PathBuf>,
    known: HashSet<PathBuf>,
    inspector: ArchiveInspector,
}

impl ImageScan {
    /// Parse every archive under the roots that the catalog did not hold
    ///
    /// Rejected archives are logged and skipped.
    #[must_use]
    pub fn run(&self) -> Vec<ImageInfo> {
        let mut found = Vec::new();
        for root in &self.roots {
            let mut dirs = vec![root.clone()];
            match fs::read_dir(root) {
                Ok(entries) => {
                    let mut subdirs: Vec<PathBuf> = entries
                        .filter_map(Result::ok)
                        .map(|entry| entry.path())
                        .filter(|path| path.is_dir())
                        .collect();
                    subdirs.sort();
                    dirs.extend(subdirs);
                }
                Err(e) => {
                    warn!("Skipping update directory {}: {}", root.display(), e);
                    continue;
                }
            }

            for dir in dirs {
                self.scan_dir(&dir, &mut found);
            }
        }
        found
    }

    fn scan_dir(&self, dir: &Path, found: &mut Vec<ImageInfo>) {
        let mut archives: Vec<PathBuf> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && archive::is_archive(path))
                .collect(),
            Err(e) => {
                warn!("Failed to list {}: {}", dir.display(), e);
                return;
            }
        };
        archives.sort();

        for path in archives {
            if self.known.contains(&path) {
                debug!(archive = ?path, "Archive already cataloged");
                continue;
            }
            match self.inspector.inspect(&path) {
                Ok(entry) => found.push(entry),
                Err(e) => warn!("Rejected update archive: {}", e),
            }
        }
    }
}

/// Catalog of update images
pub struct ImageCatalog {
    entries: Vec<Option<ImageInfo>>,
    inspector: ArchiveInspector,
}

impl std::fmt::Debug for ImageCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCatalog")
            .field("entries", &self.entries.len())
            .field("temp_root", &self.inspector.temp_root)
            .finish_non_exhaustive()
    }
}

impl ImageCatalog {
    /// Create an empty catalog extracting into `temp_root`
    pub fn new(
        temp_root: impl Into<PathBuf>,
        extractor: Arc<dyn Extractor>,
        tag_reader: Arc<dyn TagReader>,
    ) -> Self {
        Self {
            entries: Vec::new(),
            inspector: ArchiveInspector {
                temp_root: temp_root.into(),
                extractor,
                tag_reader,
            },
        }
    }

    /// Scan each root and its immediate subdirectories for update archives
    ///
    /// Archives already in the catalog are skipped. Rejected archives are
    /// logged and skipped. Returns the number of entries added.
    pub fn scan(&mut self, roots: &[PathBuf]) -> usize {
        let found = self.scan_job(roots).run();
        self.publish(found)
    }

    /// Prepare a scan that can run without borrowing the catalog
    #[must_use]
    pub fn scan_job(&self, roots: &[PathBuf]) -> ImageScan {
        ImageScan {
            roots: roots.to_vec(),
            known: self.iter().map(|entry| entry.archive_path.clone()).collect(),
            inspector: self.inspector.clone(),
        }
    }

    /// Append scanned entries, assigning ids in order
    ///
    /// Entries whose archive was cataloged in the meantime are dropped.
    /// Returns the number of entries added.
    pub fn publish(&mut self, found: Vec<ImageInfo>) -> usize {
        let mut added = 0usize;
        for entry in found {
            if self.contains_archive(&entry.archive_path) {
                debug!(archive = ?entry.archive_path, "Archive already cataloged");
                continue;
            }
            self.append(entry);
            added += 1;
        }
        info!("Image scan complete: {} added, {} total", added, self.len());
        added
    }

    /// Parse an archive and append it as a new entry
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::DescriptorInvalid`] or an I/O error if the
    /// archive cannot be extracted or its descriptor fails validation.
    pub fn add_archive(&mut self, archive: &Path) -> ImageResult<usize> {
        let entry = self.inspector.inspect(archive)?;
        Ok(self.append(entry))
    }

    fn append(&mut self, mut entry: ImageInfo) -> usize {
        let id = self.entries.len();
        entry.id = id;
        info!(
            "Cataloged image {}: {} {} v{} ({} bytes)",
            id, entry.device_name, entry.image_type, entry.version_software, entry.size
        );
        self.entries.push(Some(entry));
        id
    }

    /// Catalog an archive delivered by the external push feed
    ///
    /// Without `explicit_id` the entry is appended. With one, the catalog
    /// grows to hold that index and the entry there is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::ImageInUse`] if the entry at `explicit_id` still
    /// has readers, [`ImageError::ImageIdOutOfRange`] if the id is more than
    /// [`MAX_CATALOG_GAP`] slots past the end, or any parse error from the
    /// archive.
    pub fn process_external_push(
        &mut self,
        archive: &Path,
        explicit_id: Option<usize>,
    ) -> ImageResult<usize> {
        self.check_push_target(explicit_id)?;
        let entry = self.inspector.inspect(archive)?;
        self.publish_push(entry, explicit_id)
    }

    /// Whether a push may land at `explicit_id`
    ///
    /// # Errors
    ///
    /// See [`ImageCatalog::process_external_push`].
    pub fn check_push_target(&self, explicit_id: Option<usize>) -> ImageResult<()> {
        let Some(id) = explicit_id else {
            return Ok(());
        };

        let limit = self.entries.len().saturating_add(MAX_CATALOG_GAP);
        if id > limit {
            return Err(ImageError::ImageIdOutOfRange { id, limit });
        }
        if let Some(Some(current)) = self.entries.get(id)
            && current.in_use()
        {
            return Err(ImageError::ImageInUse {
                id,
                readers: current.reader_count,
            });
        }
        Ok(())
    }

    /// Store an inspected push entry
    ///
    /// # Errors
    ///
    /// See [`ImageCatalog::process_external_push`]. The catalog is unchanged
    /// on error.
    pub fn publish_push(&mut self, mut entry: ImageInfo, explicit_id: Option<usize>) -> ImageResult<usize> {
        let Some(id) = explicit_id else {
            return Ok(self.append(entry));
        };
        self.check_push_target(explicit_id)?;

        let len = id.checked_add(1).ok_or(ImageError::ImageIdOutOfRange {
            id,
            limit: self.entries.len().saturating_add(MAX_CATALOG_GAP),
        })?;
        if self.entries.len() < len {
            self.entries
                .try_reserve_exact(len - self.entries.len())
                .map_err(|e| ImageError::Io(io::Error::new(io::ErrorKind::OutOfMemory, e)))?;
            self.entries.resize_with(len, || None);
        }

        entry.id = id;
        if let Some(slot) = self.entries.get_mut(id) {
            if slot.is_some() {
                info!("Replacing image {} from external push", id);
            }
            *slot = Some(entry);
        }
        Ok(id)
    }

    /// Parser for archives outside the catalog lock
    #[must_use]
    pub fn inspector(&self) -> ArchiveInspector {
        self.inspector.clone()
    }

    /// Take a reader reference on an image, extracting it on first use
    ///
    /// Returns the path of the extracted image file.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::ImageNotFound`] for an unknown id or an I/O
    /// error if extraction fails. The reader count is unchanged on error.
    pub fn acquire(&mut self, id: usize) -> ImageResult<PathBuf> {
        let extract_dir = self.extract_dir(id)?;
        let extractor = Arc::clone(&self.inspector.extractor);
        let entry = self
            .entries
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(ImageError::ImageNotFound(id))?;

        let path = match &entry.extracted_path {
            Some(path) => path.clone(),
            None => {
                extractor.extract(&entry.archive_path, &extract_dir)?;
                let path = extract_dir.join(&entry.file_name);
                if !path.is_file() {
                    return Err(ImageError::descriptor_invalid(
                        &entry.archive_path,
                        format!("image file '{}' missing after extraction", entry.file_name),
                    ));
                }
                debug!(image = id, path = ?path, "Extracted image");
                entry.extracted_path = Some(path.clone());
                path
            }
        };

        entry.reader_count += 1;
        Ok(path)
    }

    /// Drop a reader reference, freeing the extraction when none remain
    pub fn release(&mut self, id: usize) {
        let Ok(extract_dir) = self.extract_dir(id) else {
            warn!("Release of unknown image {}", id);
            return;
        };
        let Some(entry) = self.entries.get_mut(id).and_then(Option::as_mut) else {
            warn!("Release of unknown image {}", id);
            return;
        };
        if entry.reader_count == 0 {
            warn!("Release of image {} with no readers", id);
            return;
        }

        entry.reader_count -= 1;
        if entry.reader_count == 0 && entry.extracted_path.take().is_some() {
            if let Err(e) = fs::remove_dir_all(&extract_dir) {
                warn!("Failed to remove {}: {}", extract_dir.display(), e);
            }
            if let Some(parent) = extract_dir.parent() {
                archive::remove_empty_dirs(parent, &self.inspector.temp_root);
            }
            debug!(image = id, "Freed extracted image");
        }
    }

    fn extract_dir(&self, id: usize) -> ImageResult<PathBuf> {
        let entry = self.get(id).ok_or(ImageError::ImageNotFound(id))?;
        Ok(self
            .inspector
            .temp_root
            .join(format!("image-{id}"))
            .join(archive::archive_stem(&entry.archive_path)))
    }

    /// Whether `id` names a catalog entry
    #[must_use]
    pub fn is_valid_id(&self, id: usize) -> bool {
        matches!(self.entries.get(id), Some(Some(_)))
    }

    /// Entry at `id`
    #[must_use]
    pub fn get(&self, id: usize) -> Option<&ImageInfo> {
        self.entries.get(id).and_then(Option::as_ref)
    }

    /// Whether `archive` has already been cataloged
    #[must_use]
    pub fn contains_archive(&self, archive: &Path) -> bool {
        self.iter().any(|entry| entry.archive_path == archive)
    }

    /// Iterate over occupied entries in id order
    pub fn iter(&self) -> impl Iterator<Item = &ImageInfo> + Clone {
        self.entries.iter().filter_map(Option::as_ref)
    }

    /// Number of slots, including any gaps left by explicit-id pushes
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog has no slots
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Directory extractions are written under
    #[must_use]
    pub fn temp_root(&self) -> &Path {
        &self.inspector.temp_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::XmlTagReader;

    /// Treats the "archive" as a directory and copies its files
    struct CopyExtractor;

    impl Extractor for CopyExtractor {
        fn extract(&self, archive: &Path, dest: &Path) -> io::Result<()> {
            fs::create_dir_all(dest)?;
            for entry in fs::read_dir(archive)? {
                let entry = entry?;
                fs::copy(entry.path(), dest.join(entry.file_name()))?;
            }
            Ok(())
        }
    }

    fn write_bundle(dir: &Path, name: &str, version: &str, size: usize) -> io::Result<PathBuf> {
        let bundle = dir.join(format!("{name}.tgz"));
        fs::create_dir_all(&bundle)?;
        fs::write(
            bundle.join("image.xml"),
            format!(
                "<image><productName>XR15-10</productName><type>firmware</type>\
                 <version>{version}</version><bootloaderVersionMin>1.0.0.0</bootloaderVersionMin>\
                 <hwVersionMin>2.3.0.0</hwVersionMin><fileName>fw.bin</fileName>\
                 <size>{size}</size><crc>1234</crc></image>"
            ),
        )?;
        fs::write(bundle.join("fw.bin"), vec![0xA5u8; size])?;
        Ok(bundle)
    }

    fn catalog(temp: &Path) -> ImageCatalog {
        ImageCatalog::new(temp, Arc::new(CopyExtractor), Arc::new(XmlTagReader))
    }

    #[test]
    fn test_acquire_release_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
        let src = tempfile::tempdir()?;
        let temp = tempfile::tempdir()?;
        let bundle = write_bundle(src.path(), "fw", "2.0.0.0", 64)?;

        let mut catalog = catalog(temp.path());
        let id = catalog.add_archive(&bundle)?;
        assert!(catalog.is_valid_id(id));
        assert!(!catalog.is_valid_id(id + 1));

        let path = catalog.acquire(id)?;
        assert!(path.is_file());
        let again = catalog.acquire(id)?;
        assert_eq!(path, again);
        assert_eq!(catalog.get(id).map(|e| e.reader_count), Some(2));

        catalog.release(id);
        assert!(path.is_file());
        catalog.release(id);
        assert!(!path.exists());
        assert!(!temp.path().join(format!("image-{id}")).exists());
        assert!(temp.path().exists());
        Ok(())
    }

    #[test]
    fn test_push_overwrite_rejected_while_in_use() -> Result<(), Box<dyn std::error::Error>> {
        let src = tempfile::tempdir()?;
        let temp = tempfile::tempdir()?;
        let first = write_bundle(src.path(), "a", "2.0.0.0", 16)?;
        let second = write_bundle(src.path(), "b", "3.0.0.0", 16)?;

        let mut catalog = catalog(temp.path());
        let id = catalog.process_external_push(&first, Some(3))?;
        assert_eq!(id, 3);
        assert_eq!(catalog.len(), 4);
        assert!(!catalog.is_valid_id(1));

        catalog.acquire(3)?;
        let err = catalog.process_external_push(&second, Some(3));
        assert!(matches!(err, Err(ImageError::ImageInUse { id: 3, readers: 1 })));

        catalog.release(3);
        catalog.process_external_push(&second, Some(3))?;
        assert_eq!(
            catalog.get(3).map(|e| e.version_software.to_string()),
            Some("3.0.0.0".to_string())
        );
        Ok(())
    }

    #[test]
    fn test_push_far_past_end_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let src = tempfile::tempdir()?;
        let temp = tempfile::tempdir()?;
        let first = write_bundle(src.path(), "a", "2.0.0.0", 16)?;
        let second = write_bundle(src.path(), "b", "3.0.0.0", 16)?;

        let mut catalog = catalog(temp.path());
        catalog.add_archive(&first)?;

        for id in [usize::MAX / 2, usize::MAX, 1 + MAX_CATALOG_GAP + 1] {
            let result = catalog.process_external_push(&second, Some(id));
            assert!(
                matches!(result, Err(ImageError::ImageIdOutOfRange { limit, .. }) if limit == 1 + MAX_CATALOG_GAP),
                "id {id} accepted: {result:?}"
            );
            assert_eq!(catalog.len(), 1);
        }
        assert!(!catalog.contains_archive(&second));

        let id = catalog.process_external_push(&second, Some(1 + MAX_CATALOG_GAP))?;
        assert_eq!(id, 1 + MAX_CATALOG_GAP);
        assert_eq!(catalog.len(), 2 + MAX_CATALOG_GAP);
        assert_eq!(catalog.get(id).map(|e| e.id), Some(id));
        Ok(())
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_unbalanced_release_is_logged() -> Result<(), Box<dyn std::error::Error>> {
        let src = tempfile::tempdir()?;
        let temp = tempfile::tempdir()?;
        let bundle = write_bundle(src.path(), "fw", "2.0.0.0", 16)?;

        let mut catalog = catalog(temp.path());
        let id = catalog.add_archive(&bundle)?;
        catalog.release(id);
        catalog.release(42);

        assert!(logs_contain("with no readers"));
        assert!(logs_contain("Release of unknown image 42"));
        assert_eq!(catalog.get(id).map(|e| e.reader_count), Some(0));
        Ok(())
    }
}
