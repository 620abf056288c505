//! Update archive extraction

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

/// Unpacks an update archive into a directory
pub trait Extractor: Send + Sync {
    /// Extract `archive` into `dest`, creating `dest` if needed
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the archive cannot be read or unpacked.
    fn extract(&self, archive: &Path, dest: &Path) -> io::Result<()>;
}

/// [`Extractor`] for gzip-compressed tarballs (`.tgz`, `.tar.gz`)
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzExtractor;

impl Extractor for TarGzExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> io::Result<()> {
        debug!(archive = ?archive, dest = ?dest, "Extracting archive");
        fs::create_dir_all(dest)?;
        let file = File::open(archive)?;
        let mut tarball = tar::Archive::new(GzDecoder::new(file));
        tarball.unpack(dest)
    }
}

/// Whether a path names a gzip tarball by extension
#[must_use]
pub fn is_archive(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".tgz") || name.ends_with(".tar.gz"))
}

/// Archive file name with its `.tgz` / `.tar.gz` extension removed
#[must_use]
pub fn archive_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image");
    name.strip_suffix(".tar.gz")
        .or_else(|| name.strip_suffix(".tgz"))
        .unwrap_or(name)
        .to_string()
}

/// First `.xml` file directly inside `dir`
///
/// # Errors
///
/// Returns an I/O error if `dir` cannot be listed.
pub fn find_descriptor(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut found: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
        })
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}

/// Remove `path` and then each empty parent up to, but not including, `root`
pub fn remove_empty_dirs(path: &Path, root: &Path) {
    let mut current = Some(path);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Only succeeds on empty directories
        if fs::remove_dir(dir).is_err() {
            break;
        }
        debug!(dir = ?dir, "Removed empty temp directory");
        current = dir.parent();
    }
}
