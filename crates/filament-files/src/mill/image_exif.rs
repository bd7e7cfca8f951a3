//! EXIF mill: extracts image metadata into a plaintext JSON document
//!
//! The output is stored unencrypted (it carries dimensions and capture
//! metadata, not content) so readers can pick variants without keys.

use std::collections::BTreeMap;
use std::io::Cursor;

use exif::{In, Tag};
use image::ImageReader;

use filament_core::FileResult;

use super::{Mill, MillResult};

#[derive(Debug, Default)]
pub struct ImageExif;

impl Mill for ImageExif {
    fn id(&self) -> &'static str {
        "/image/exif"
    }

    fn encrypt(&self) -> bool {
        false
    }

    fn mill(&self, input: &[u8], name: &str) -> FileResult<MillResult> {
        let reader = ImageReader::new(Cursor::new(input))
            .with_guessed_format()
            .map_err(anyhow::Error::from)?;
        let format = reader
            .format()
            .ok_or_else(|| anyhow::anyhow!("unknown image format"))?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| anyhow::anyhow!("read image dimensions: {e}"))?;

        let mut doc = serde_json::Map::new();
        doc.insert("name".into(), serde_json::json!(name));
        doc.insert(
            "format".into(),
            serde_json::json!(format.extensions_str().first().copied().unwrap_or("unknown")),
        );
        doc.insert("width".into(), serde_json::json!(width));
        doc.insert("height".into(), serde_json::json!(height));

        // Most sources carry no EXIF segment at all; that is not an error.
        if let Ok(parsed) = exif::Reader::new().read_from_container(&mut Cursor::new(input)) {
            if let Some(field) = parsed.get_field(Tag::DateTimeOriginal, In::PRIMARY) {
                doc.insert(
                    "created".into(),
                    serde_json::json!(field.display_value().to_string()),
                );
            }
            if let Some(field) = parsed.get_field(Tag::Model, In::PRIMARY) {
                doc.insert(
                    "model".into(),
                    serde_json::json!(field.display_value().to_string()),
                );
            }
        }

        let mut meta = BTreeMap::new();
        meta.insert("width".to_string(), width.to_string());
        meta.insert("height".to_string(), height.to_string());
        Ok(MillResult {
            data: serde_json::to_vec(&serde_json::Value::Object(doc))
                .map_err(anyhow::Error::from)?,
            meta,
        })
    }
}
