//! Catalog entry types

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ImageError;
use crate::version::{HardwareVersion, SoftwareVersion};

/// Kind of payload an update image carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    /// Remote firmware
    Firmware,
    /// Primary audio data (voice prompts, themes)
    AudioData1,
    /// Secondary audio data
    AudioData2,
    /// DSP program
    Dsp,
    /// Wake-word keyword model
    KeywordModel,
}

impl ImageType {
    /// Descriptor spelling of this type
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ImageType::Firmware => "firmware",
            ImageType::AudioData1 => "audio_data_1",
            ImageType::AudioData2 => "audio_data_2",
            ImageType::Dsp => "dsp",
            ImageType::KeywordModel => "keyword_model",
        }
    }
}

impl FromStr for ImageType {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firmware" => Ok(ImageType::Firmware),
            "audio_data" | "audio_data_1" => Ok(ImageType::AudioData1),
            "audio_data_2" => Ok(ImageType::AudioData2),
            "dsp" => Ok(ImageType::Dsp),
            "keyword_model" => Ok(ImageType::KeywordModel),
            other => Err(ImageError::UnsupportedImageType(other.to_string())),
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio theme selector carried by audio-data images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AudioTheme(pub u8);

impl AudioTheme {
    /// Theme shipped with the remote
    pub const DEFAULT: AudioTheme = AudioTheme(0);
    /// No theme reported or theme unknown
    pub const INVALID: AudioTheme = AudioTheme(0xFF);

    /// Entries with this theme take part in the general version pass
    #[must_use]
    pub fn is_default_or_invalid(self) -> bool {
        self == Self::DEFAULT || self == Self::INVALID
    }

    /// A specific, non-default theme was requested
    #[must_use]
    pub fn is_concrete(self) -> bool {
        !self.is_default_or_invalid()
    }
}

/// One update image known to the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Catalog index, stable once assigned
    pub id: usize,

    /// Product name from the descriptor, including any `Z` suffix
    pub device_name: String,

    /// Controller type this image targets (device name without the `Z` suffix)
    pub controller_type: String,

    /// Payload kind
    pub image_type: ImageType,

    /// Version the image installs
    pub version_software: SoftwareVersion,

    /// Minimum bootloader the remote must already run
    pub version_bootloader_min: SoftwareVersion,

    /// Minimum hardware the remote must be
    pub version_hardware_min: HardwareVersion,

    /// Image size in bytes
    pub size: u64,

    /// CRC carried for the remote to verify after download
    pub crc: u32,

    /// Install even if not newer than the running version
    pub force_update: bool,

    /// Remote should not load the image immediately after download
    pub suppress_immediate_load: bool,

    /// Audio theme of this image
    pub audio_theme: AudioTheme,

    /// Image targets the "Z" hardware variant
    pub type_z: bool,

    /// Sessions currently holding the extracted image open
    pub reader_count: u32,

    /// Archive the image was parsed from
    pub archive_path: PathBuf,

    /// Image file name inside the archive
    pub file_name: String,

    /// Extracted image file while `reader_count > 0`
    pub extracted_path: Option<PathBuf>,
}

impl ImageInfo {
    /// Split a product name into its controller type and Z-variant flag
    #[must_use]
    pub fn split_device_name(device_name: &str) -> (String, bool) {
        match device_name.strip_suffix('Z') {
            Some(base) if !base.is_empty() => (base.to_string(), true),
            _ => (device_name.to_string(), false),
        }
    }

    /// Whether any session is reading this image
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.reader_count > 0
    }
}
