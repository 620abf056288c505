//! Convenience re-exports for common catalog types

pub use crate::archive::{Extractor, TarGzExtractor};
pub use crate::catalog::ImageCatalog;
pub use crate::descriptor::{TagReader, XmlTagReader};
pub use crate::error::{ImageError, ImageResult};
pub use crate::image::{AudioTheme, ImageInfo, ImageType};
pub use crate::matcher::{Candidate, UpdateQuery, find_best_candidate};
pub use crate::version::{HardwareVersion, SoftwareVersion};
