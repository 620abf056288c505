//! Update image catalog for RCU over-the-air updates
//!
//! This crate knows which update images exist and which one a given remote
//! should receive:
//! - Directory scanning and external-push intake of `.tgz` update archives
//! - XML descriptor parsing and validation
//! - Reference-counted extraction of images while sessions read them
//! - Version packing and the eligibility matcher
//!
//! # Architecture
//!
//! - [`catalog`]: The [`ImageCatalog`] and its extraction lifecycle
//! - [`descriptor`]: Descriptor tags and the [`TagReader`] seam
//! - [`archive`]: The [`Extractor`] seam and temp-directory helpers
//! - [`image`]: Catalog entry types
//! - [`version`]: Software and hardware version types
//! - [`matcher`]: [`find_best_candidate`]
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```
//! use rcu_image::prelude::*;
//!
//! let images: Vec<ImageInfo> = Vec::new();
//! let query = UpdateQuery {
//!     image_type: ImageType::Firmware,
//!     controller_type: "XR15-10".to_string(),
//!     hardware: HardwareVersion::new(2, 3, 1, 0),
//!     bootloader: SoftwareVersion::new(1, 0, 0, 0),
//!     software: SoftwareVersion::new(1, 9, 9, 9),
//!     audio_theme: AudioTheme::INVALID,
//!     type_z: false,
//! };
//! assert!(find_best_candidate(&images, &query).is_none());
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod archive;
pub mod catalog;
pub mod descriptor;
pub mod error;
pub mod image;
pub mod matcher;
pub mod prelude;
pub mod version;

pub use archive::{Extractor, TarGzExtractor};
pub use catalog::{ArchiveInspector, ImageCatalog, ImageScan, MAX_CATALOG_GAP};
pub use descriptor::{ImageDescriptor, TagReader, XmlTagReader, parse_descriptor};
pub use error::{ImageError, ImageResult};
pub use image::{AudioTheme, ImageInfo, ImageType};
pub use matcher::{Candidate, UpdateQuery, find_best_candidate};
pub use version::{HardwareVersion, SoftwareVersion};
