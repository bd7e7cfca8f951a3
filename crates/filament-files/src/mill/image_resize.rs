//! Image resize mill: fixed-width variants, aspect ratio preserved
//!
//! Only downscales: a target width at or above the source width re-encodes
//! at the original size. JPEG output keeps the configured quality; other
//! formats re-encode losslessly as PNG. Re-encoding strips embedded
//! metadata, which is intentional: the exif variant carries it separately.

use std::collections::BTreeMap;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ImageFormat, ImageReader};

use filament_core::FileResult;

use super::{canonical_opts, Mill, MillResult};

#[derive(Debug, Clone)]
pub struct ImageResizeOpts {
    pub width: u32,
    pub quality: u8,
}

#[derive(Debug, Clone)]
pub struct ImageResize {
    pub opts: ImageResizeOpts,
}

impl ImageResize {
    pub fn new(width: u32, quality: u8) -> Self {
        Self {
            opts: ImageResizeOpts { width, quality },
        }
    }
}

impl Mill for ImageResize {
    fn id(&self) -> &'static str {
        "/image/resize"
    }

    fn options(&self) -> String {
        let mut opts = BTreeMap::new();
        opts.insert("width", serde_json::json!(self.opts.width));
        opts.insert("quality", serde_json::json!(self.opts.quality));
        canonical_opts(&opts)
    }

    fn mill(&self, input: &[u8], _name: &str) -> FileResult<MillResult> {
        let reader = ImageReader::new(Cursor::new(input))
            .with_guessed_format()
            .map_err(anyhow::Error::from)?;
        let format = reader
            .format()
            .ok_or_else(|| anyhow::anyhow!("unknown image format"))?;
        let img = reader
            .decode()
            .map_err(|e| anyhow::anyhow!("decode image: {e}"))?;

        let target_width = self.opts.width.min(img.width());
        let resized = if target_width < img.width() {
            img.resize(target_width, u32::MAX, FilterType::Lanczos3)
        } else {
            img
        };

        let mut out = Vec::new();
        match format {
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut out, self.opts.quality);
                resized
                    .write_with_encoder(encoder)
                    .map_err(|e| anyhow::anyhow!("encode jpeg: {e}"))?;
            }
            _ => {
                resized
                    .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                    .map_err(|e| anyhow::anyhow!("encode png: {e}"))?;
            }
        }

        let mut meta = BTreeMap::new();
        meta.insert("width".to_string(), resized.width().to_string());
        meta.insert("height".to_string(), resized.height().to_string());
        Ok(MillResult { data: out, meta })
    }
}
