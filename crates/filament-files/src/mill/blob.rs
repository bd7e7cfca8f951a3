//! Passthrough mill: the stored stream is the source, byte for byte

use filament_core::FileResult;

use super::{Mill, MillResult};

#[derive(Debug, Default)]
pub struct Blob;

impl Mill for Blob {
    fn id(&self) -> &'static str {
        "/blob"
    }

    fn mill(&self, input: &[u8], _name: &str) -> FileResult<MillResult> {
        Ok(MillResult {
            data: input.to_vec(),
            meta: Default::default(),
        })
    }
}
