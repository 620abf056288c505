//! Image descriptor parsing
//!
//! Every update archive carries one XML descriptor next to the image file.
//! Field extraction goes through a [`TagReader`] so the catalog does not
//! depend on a particular XML library.

use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::{ImageError, ImageResult};
use crate::image::{AudioTheme, ImageType};
use crate::version::{HardwareVersion, SoftwareVersion};

/// Descriptor tag names
pub mod tags {
    /// Product name, `Z` suffix marks the Z hardware variant
    pub const PRODUCT_NAME: &str = "productName";
    /// Image type
    pub const TYPE: &str = "type";
    /// Software version the image installs
    pub const VERSION: &str = "version";
    /// Minimum bootloader version
    pub const BOOTLOADER_MIN: &str = "bootloaderVersionMin";
    /// Minimum hardware version
    pub const HARDWARE_MIN: &str = "hwVersionMin";
    /// Image file name inside the archive
    pub const FILE_NAME: &str = "fileName";
    /// Image size in bytes
    pub const SIZE: &str = "size";
    /// Image CRC
    pub const CRC: &str = "crc";
    /// Optional force flag
    pub const FORCE: &str = "force";
    /// Optional audio theme
    pub const AUDIO_THEME: &str = "audioTheme";
    /// Optional suppress-immediate-load flag
    pub const SUPPRESS_IMMEDIATE_LOAD: &str = "suppressImmediateLoad";
}

/// Reads the text content of a named tag out of an XML document
pub trait TagReader: Send + Sync {
    /// Text of the first element called `tag`, trimmed, or `None` if absent
    fn read_tag(&self, xml: &str, tag: &str) -> Option<String>;
}

/// [`TagReader`] backed by `quick-xml`
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlTagReader;

impl TagReader for XmlTagReader {
    fn read_tag(&self, xml: &str, tag: &str) -> Option<String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let wanted = tag.as_bytes();
        let mut inside = false;
        let mut text = String::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(element)) => {
                    if !inside && element.local_name().as_ref() == wanted {
                        inside = true;
                        text.clear();
                    }
                }
                Ok(Event::Empty(element)) => {
                    if !inside && element.local_name().as_ref() == wanted {
                        return Some(String::new());
                    }
                }
                Ok(Event::Text(content)) if inside => match content.unescape() {
                    Ok(unescaped) => text.push_str(&unescaped),
                    Err(_) => return None,
                },
                Ok(Event::CData(content)) if inside => {
                    text.push_str(&String::from_utf8_lossy(&content));
                }
                Ok(Event::End(element)) => {
                    if inside && element.local_name().as_ref() == wanted {
                        return Some(text.trim().to_string());
                    }
                }
                Ok(Event::Eof) | Err(_) => return None,
                _ => {}
            }
        }
    }
}

/// Validated contents of an image descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Product name
    pub device_name: String,
    /// Image type
    pub image_type: ImageType,
    /// Software version
    pub version: SoftwareVersion,
    /// Minimum bootloader version
    pub bootloader_min: SoftwareVersion,
    /// Minimum hardware version
    pub hardware_min: HardwareVersion,
    /// Image file name
    pub file_name: String,
    /// Image size in bytes
    pub size: u64,
    /// Image CRC
    pub crc: u32,
    /// Force flag
    pub force_update: bool,
    /// Suppress-immediate-load flag
    pub suppress_immediate_load: bool,
    /// Audio theme, default when absent
    pub audio_theme: AudioTheme,
}

/// Parse and validate a descriptor document
///
/// # Errors
///
/// Returns [`ImageError::DescriptorInvalid`] naming `source` when a required
/// tag is missing or any value fails validation.
pub fn parse_descriptor(
    xml: &str,
    reader: &dyn TagReader,
    source: &Path,
) -> ImageResult<ImageDescriptor> {
    let invalid = |reason: String| ImageError::descriptor_invalid(source, reason);
    let required = |tag: &str| {
        reader
            .read_tag(xml, tag)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| invalid(format!("missing <{tag}>")))
    };

    let device_name = required(tags::PRODUCT_NAME)?;
    let image_type: ImageType = required(tags::TYPE)?
        .parse()
        .map_err(|e: ImageError| invalid(e.to_string()))?;
    let version = SoftwareVersion::parse(&required(tags::VERSION)?)
        .map_err(|e| invalid(e.to_string()))?;
    let bootloader_min = SoftwareVersion::parse(&required(tags::BOOTLOADER_MIN)?)
        .map_err(|e| invalid(e.to_string()))?;
    let hardware_min = HardwareVersion::parse(&required(tags::HARDWARE_MIN)?)
        .map_err(|e| invalid(e.to_string()))?;
    let file_name = required(tags::FILE_NAME)?;
    if Path::new(&file_name).components().count() != 1 {
        return Err(invalid(format!("file name '{file_name}' is not a plain name")));
    }

    let size_text = required(tags::SIZE)?;
    let size: u64 = size_text
        .parse()
        .map_err(|_parse| invalid(format!("size '{size_text}' is not a number")))?;
    if size == 0 {
        return Err(invalid("size is zero".to_string()));
    }

    let crc_text = required(tags::CRC)?;
    let crc = parse_u32(&crc_text).ok_or_else(|| invalid(format!("crc '{crc_text}' is not a u32")))?;

    let force_update = optional_flag(reader, xml, tags::FORCE).map_err(&invalid)?;
    let suppress_immediate_load =
        optional_flag(reader, xml, tags::SUPPRESS_IMMEDIATE_LOAD).map_err(&invalid)?;

    let audio_theme = match reader.read_tag(xml, tags::AUDIO_THEME) {
        None => AudioTheme::DEFAULT,
        Some(text) if text.is_empty() => AudioTheme::DEFAULT,
        Some(text) => AudioTheme(
            text.parse()
                .map_err(|_parse| invalid(format!("audio theme '{text}' is not a byte")))?,
        ),
    };

    Ok(ImageDescriptor {
        device_name,
        image_type,
        version,
        bootloader_min,
        hardware_min,
        file_name,
        size,
        crc,
        force_update,
        suppress_immediate_load,
        audio_theme,
    })
}

fn parse_u32(text: &str) -> Option<u32> {
    match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn optional_flag(reader: &dyn TagReader, xml: &str, tag: &str) -> Result<bool, String> {
    match reader.read_tag(xml, tag) {
        None => Ok(false),
        Some(text) => match text.to_ascii_lowercase().as_str() {
            "" | "false" | "0" | "no" => Ok(false),
            "true" | "1" | "yes" => Ok(true),
            other => Err(format!("<{tag}> value '{other}' is not a boolean")),
        },
    }
}
