//! Eligibility matching
//!
//! Picks the best image for a remote out of the catalog given what the remote
//! reports about itself. Pure functions over catalog entries.

use serde::{Deserialize, Serialize};

use crate::image::{AudioTheme, ImageInfo, ImageType};
use crate::version::{HardwareVersion, SoftwareVersion};

/// What a remote reports when asking for an update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateQuery {
    /// Payload kind being asked about
    pub image_type: ImageType,
    /// Remote's controller type
    pub controller_type: String,
    /// Remote's hardware version
    pub hardware: HardwareVersion,
    /// Remote's bootloader version
    pub bootloader: SoftwareVersion,
    /// Remote's running software version for this image type
    pub software: SoftwareVersion,
    /// Audio theme requested, [`AudioTheme::INVALID`] when none
    pub audio_theme: AudioTheme,
    /// Remote is a Z hardware variant
    pub type_z: bool,
}

/// Image selected for a remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Catalog id
    pub id: usize,
    /// Version the image installs
    pub version: SoftwareVersion,
    /// Image size in bytes
    pub size: u64,
    /// Image CRC
    pub crc: u32,
    /// Install regardless of version ordering
    pub force_update: bool,
    /// Remote should not load immediately after download
    pub suppress_immediate_load: bool,
    /// Image targets the Z variant
    pub type_z: bool,
    /// Image file name
    pub file_name: String,
}

impl Candidate {
    fn from_entry(entry: &ImageInfo, force_update: bool) -> Self {
        Self {
            id: entry.id,
            version: entry.version_software,
            size: entry.size,
            crc: entry.crc,
            force_update,
            suppress_immediate_load: entry.suppress_immediate_load,
            type_z: entry.type_z,
            file_name: entry.file_name.clone(),
        }
    }
}

fn compatible(entry: &ImageInfo, query: &UpdateQuery) -> bool {
    entry.image_type == query.image_type
        && entry.controller_type == query.controller_type
        && query.hardware.meets_minimum(&entry.version_hardware_min)
        && query.bootloader >= entry.version_bootloader_min
}

/// Find the best image for `query` among `entries`
///
/// A concrete audio theme request for audio data first looks for an image
/// with exactly that theme; such a match is always forced. The general pass
/// then considers default-theme images of the same Z variant: a forced image
/// is taken when its version differs from the running one and is not lower
/// than the best so far, otherwise an image is taken only when strictly newer
/// than both the running version and the best so far.
pub fn find_best_candidate<'a, I>(entries: I, query: &UpdateQuery) -> Option<Candidate>
where
    I: IntoIterator<Item = &'a ImageInfo>,
    I::IntoIter: Clone,
{
    let entries = entries.into_iter();
    let mut best: Option<Candidate> = None;

    if query.image_type == ImageType::AudioData1 && query.audio_theme.is_concrete() {
        best = entries
            .clone()
            .find(|entry| compatible(entry, query) && entry.audio_theme == query.audio_theme)
            .map(|entry| Candidate::from_entry(entry, true));
    }

    for entry in entries {
        if !compatible(entry, query)
            || entry.type_z != query.type_z
            || !entry.audio_theme.is_default_or_invalid()
        {
            continue;
        }

        let best_version = best.as_ref().map(|c| c.version).unwrap_or_default();
        let version = entry.version_software;

        if entry.force_update && version != query.software && version >= best_version {
            best = Some(Candidate::from_entry(entry, true));
        } else if version > query.software && version > best_version {
            best = Some(Candidate::from_entry(entry, entry.force_update));
        }
    }

    best
}
