//! Mills: named transformations from an input byte stream to an output
//! stream plus a metadata bag
//!
//! The codec dispatches on the mill id through `AnyMill`; adding a mill
//! means extending the tag set and the registry, not introducing runtime
//! type checks.

mod blob;
mod image_exif;
mod image_resize;
mod json;

pub use blob::Blob;
pub use image_exif::ImageExif;
pub use image_resize::{ImageResize, ImageResizeOpts};
pub use json::Json;

use std::collections::BTreeMap;

use filament_core::FileResult;

#[derive(Debug, Default)]
pub struct MillResult {
    pub data: Vec<u8>,
    /// Free-form attribute bag, e.g. `{width, height}` for images.
    pub meta: BTreeMap<String, String>,
}

pub trait Mill: Send + Sync {
    fn id(&self) -> &'static str;
    /// Whether the milled output is encrypted before storage.
    fn encrypt(&self) -> bool {
        true
    }
    /// Canonical option string; part of the dedup key.
    fn options(&self) -> String {
        String::new()
    }
    fn mill(&self, input: &[u8], name: &str) -> FileResult<MillResult>;
}

/// Canonical JSON of sorted key/value pairs; stable across runs.
pub(crate) fn canonical_opts(opts: &BTreeMap<&str, serde_json::Value>) -> String {
    if opts.is_empty() {
        return String::new();
    }
    serde_json::to_string(opts).expect("BTreeMap of json values always serializes")
}

/// Tagged mill dispatch.
pub enum AnyMill {
    Blob(Blob),
    Json(Json),
    Resize(ImageResize),
    Exif(ImageExif),
}

impl AnyMill {
    fn inner(&self) -> &dyn Mill {
        match self {
            AnyMill::Blob(m) => m,
            AnyMill::Json(m) => m,
            AnyMill::Resize(m) => m,
            AnyMill::Exif(m) => m,
        }
    }
}

impl Mill for AnyMill {
    fn id(&self) -> &'static str {
        self.inner().id()
    }

    fn encrypt(&self) -> bool {
        self.inner().encrypt()
    }

    fn options(&self) -> String {
        self.inner().options()
    }

    fn mill(&self, input: &[u8], name: &str) -> FileResult<MillResult> {
        self.inner().mill(input, name)
    }
}
