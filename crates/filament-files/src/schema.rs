//! Declarative node schemas
//!
//! A schema fixes which variants a source produces and how they wrap into
//! pair nodes. Steps may read a prior step's output instead of the source
//! (`use_step`), which is how the resize chain feeds each size from the
//! previous one.

use crate::mill::{AnyMill, Blob, ImageExif, ImageResize};

pub const LARGE_WIDTH: u32 = 1920;
pub const SMALL_WIDTH: u32 = 320;
pub const THUMB_WIDTH: u32 = 100;

const LARGE_QUALITY: u8 = 85;
const SMALL_QUALITY: u8 = 80;

pub struct SchemaStep {
    /// Variant name; becomes the link name inside the file directory.
    pub name: &'static str,
    pub mill: AnyMill,
    /// Read this step's input from a named earlier step instead of the
    /// source.
    pub use_step: Option<&'static str>,
}

impl SchemaStep {
    fn new(name: &'static str, mill: AnyMill, use_step: Option<&'static str>) -> Self {
        Self {
            name,
            mill,
            use_step,
        }
    }
}

/// Single-variant schema for ordinary files.
pub fn blob_node() -> Vec<SchemaStep> {
    vec![SchemaStep::new("original", AnyMill::Blob(Blob), None)]
}

/// Image schema: passthrough original, three fixed sizes, plaintext exif.
/// Steps are listed in dependency order.
pub fn image_node() -> Vec<SchemaStep> {
    vec![
        SchemaStep::new("original", AnyMill::Blob(Blob), None),
        SchemaStep::new(
            "large",
            AnyMill::Resize(ImageResize::new(LARGE_WIDTH, LARGE_QUALITY)),
            Some("original"),
        ),
        SchemaStep::new(
            "small",
            AnyMill::Resize(ImageResize::new(SMALL_WIDTH, SMALL_QUALITY)),
            Some("large"),
        ),
        SchemaStep::new(
            "thumb",
            AnyMill::Resize(ImageResize::new(THUMB_WIDTH, SMALL_QUALITY)),
            Some("small"),
        ),
        SchemaStep::new("exif", AnyMill::Exif(ImageExif), Some("original")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mill::Mill;

    #[test]
    fn image_schema_resolves_dependencies_in_order() {
        let steps = image_node();
        for (i, step) in steps.iter().enumerate() {
            if let Some(dep) = step.use_step {
                let dep_pos = steps.iter().position(|s| s.name == dep);
                assert!(dep_pos.is_some(), "unknown dependency {dep}");
                assert!(dep_pos.unwrap() < i, "{} depends on a later step", step.name);
            }
        }
    }

    #[test]
    fn exif_is_the_only_plaintext_step() {
        for step in image_node() {
            assert_eq!(step.mill.encrypt(), step.name != "exif");
        }
    }
}
