//! Software and hardware version parsing and comparison
//!
//! Remotes report four single-byte version components. Software and
//! bootloader versions compare as a packed big-endian `u32`; hardware
//! versions use a per-field minimum check where the manufacturer must match
//! exactly.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ImageError, ImageResult};

/// Largest manufacturer id a descriptor may carry
pub const MAX_HW_MANUFACTURER: u8 = 15;

/// Largest hardware model a descriptor may carry
pub const MAX_HW_MODEL: u8 = 15;

/// A software or bootloader version `major.minor.revision.patch`
///
/// Ordering is numeric on [`SoftwareVersion::packed`], so `1.2.3.4 < 1.2.3.5`
/// and `1.10.0.0 > 1.9.255.255`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SoftwareVersion {
    /// Major component
    pub major: u8,
    /// Minor component
    pub minor: u8,
    /// Revision component
    pub revision: u8,
    /// Patch component
    pub patch: u8,
}

impl SoftwareVersion {
    /// Create a version from its four components
    #[must_use]
    pub const fn new(major: u8, minor: u8, revision: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            revision,
            patch,
        }
    }

    /// Pack the components into a `u32`, most significant byte first
    #[must_use]
    pub const fn packed(&self) -> u32 {
        u32::from_be_bytes([self.major, self.minor, self.revision, self.patch])
    }

    /// Inverse of [`SoftwareVersion::packed`]
    #[must_use]
    pub const fn from_packed(value: u32) -> Self {
        let [major, minor, revision, patch] = value.to_be_bytes();
        Self::new(major, minor, revision, patch)
    }

    /// Parse dotted text such as `"2.0.0.1"`
    ///
    /// Missing trailing components are zero, so `"2.1"` parses as `2.1.0.0`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::InvalidVersion`] if the text is empty, has more
    /// than four components, or any component is not a number in `0..=255`.
    pub fn parse(s: &str) -> ImageResult<Self> {
        let [major, minor, revision, patch] = parse_components(s)?;
        Ok(Self::new(major, minor, revision, patch))
    }
}

impl Ord for SoftwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.packed().cmp(&other.packed())
    }
}

impl PartialOrd for SoftwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for SoftwareVersion {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.patch
        )
    }
}

/// A remote's hardware identity `manufacturer.model.revision.lot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HardwareVersion {
    /// Manufacturer id (0..=15)
    pub manufacturer: u8,
    /// Hardware model (0..=15)
    pub model: u8,
    /// Board revision
    pub hw_revision: u8,
    /// Production lot
    pub lot: u8,
}

impl HardwareVersion {
    /// Create a hardware version from its four fields
    #[must_use]
    pub const fn new(manufacturer: u8, model: u8, hw_revision: u8, lot: u8) -> Self {
        Self {
            manufacturer,
            model,
            hw_revision,
            lot,
        }
    }

    /// Parse dotted text such as `"2.3.1.0"`
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::InvalidVersion`] on malformed text, when the
    /// manufacturer exceeds [`MAX_HW_MANUFACTURER`] or the model exceeds
    /// [`MAX_HW_MODEL`].
    pub fn parse(s: &str) -> ImageResult<Self> {
        let [manufacturer, model, hw_revision, lot] = parse_components(s)?;
        if manufacturer > MAX_HW_MANUFACTURER {
            return Err(ImageError::invalid_version(
                s,
                format!("manufacturer {manufacturer} exceeds {MAX_HW_MANUFACTURER}"),
            ));
        }
        if model > MAX_HW_MODEL {
            return Err(ImageError::invalid_version(
                s,
                format!("model {model} exceeds {MAX_HW_MODEL}"),
            ));
        }
        Ok(Self::new(manufacturer, model, hw_revision, lot))
    }

    /// Whether this hardware satisfies an image's minimum hardware version
    ///
    /// The manufacturer must match exactly; model and revision must be at
    /// least the minimum. The lot is not compared.
    #[must_use]
    pub fn meets_minimum(&self, min: &HardwareVersion) -> bool {
        self.manufacturer == min.manufacturer
            && self.model >= min.model
            && self.hw_revision >= min.hw_revision
    }
}

impl FromStr for HardwareVersion {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HardwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.manufacturer, self.model, self.hw_revision, self.lot
        )
    }
}

fn parse_components(s: &str) -> ImageResult<[u8; 4]> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(ImageError::invalid_version(s, "empty version string"));
    }

    let mut components = [0u8; 4];
    let mut count = 0usize;
    for part in trimmed.split('.') {
        let Some(slot) = components.get_mut(count) else {
            return Err(ImageError::invalid_version(s, "more than four components"));
        };
        if part.is_empty() {
            return Err(ImageError::invalid_version(s, "empty component"));
        }
        let value: u32 = part
            .parse()
            .map_err(|e: std::num::ParseIntError| ImageError::invalid_version(s, e.to_string()))?;
        *slot = u8::try_from(value)
            .map_err(|_overflow| ImageError::invalid_version(s, format!("{value} exceeds 255")))?;
        count += 1;
    }

    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_ordering() {
        assert!(SoftwareVersion::new(1, 2, 3, 4) < SoftwareVersion::new(1, 2, 3, 5));
        assert!(SoftwareVersion::new(1, 10, 0, 0) > SoftwareVersion::new(1, 9, 255, 255));
        assert_eq!(SoftwareVersion::new(1, 2, 3, 4).packed(), 0x0102_0304);
    }

    #[test]
    fn test_parse_software() -> ImageResult<()> {
        assert_eq!(SoftwareVersion::parse("2.0.0.1")?, SoftwareVersion::new(2, 0, 0, 1));
        assert_eq!(SoftwareVersion::parse(" 2.1 ")?, SoftwareVersion::new(2, 1, 0, 0));
        Ok(())
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!(SoftwareVersion::parse("256.0.0.0").is_err());
        assert!(SoftwareVersion::parse("1.2.3.4.5").is_err());
        assert!(SoftwareVersion::parse("1..2").is_err());
        assert!(SoftwareVersion::parse("").is_err());
        assert!(SoftwareVersion::parse("a.b").is_err());
    }

    #[test]
    fn test_parse_hardware_limits() -> ImageResult<()> {
        assert_eq!(HardwareVersion::parse("15.15.255.255")?.model, 15);
        assert!(HardwareVersion::parse("16.1.0.0").is_err());
        assert!(HardwareVersion::parse("2.16.0.0").is_err());
        Ok(())
    }

    #[test]
    fn test_meets_minimum() {
        let min = HardwareVersion::new(2, 3, 1, 0);
        assert!(HardwareVersion::new(2, 3, 1, 0).meets_minimum(&min));
        assert!(HardwareVersion::new(2, 4, 2, 0).meets_minimum(&min));
        assert!(!HardwareVersion::new(3, 4, 2, 0).meets_minimum(&min));
        assert!(!HardwareVersion::new(2, 2, 9, 0).meets_minimum(&min));
        assert!(!HardwareVersion::new(2, 3, 0, 9).meets_minimum(&min));
    }

    #[test]
    fn test_display_roundtrip() -> ImageResult<()> {
        let v = SoftwareVersion::new(4, 3, 2, 1);
        assert_eq!(v.to_string().parse::<SoftwareVersion>()?, v);
        Ok(())
    }
}
