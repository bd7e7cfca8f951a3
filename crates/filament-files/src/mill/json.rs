//! JSON mill: validates and canonicalizes a JSON document

use filament_core::FileResult;

use super::{Mill, MillResult};

#[derive(Debug, Default)]
pub struct Json;

impl Mill for Json {
    fn id(&self) -> &'static str {
        "/json"
    }

    fn mill(&self, input: &[u8], _name: &str) -> FileResult<MillResult> {
        let value: serde_json::Value = serde_json::from_slice(input)
            .map_err(|e| anyhow::anyhow!("invalid json document: {e}"))?;
        let data = serde_json::to_vec(&value).map_err(anyhow::Error::from)?;
        Ok(MillResult {
            data,
            meta: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_whitespace() {
        let out = Json.mill(b"{ \"b\" : 1,\n \"a\": 2 }", "doc.json").unwrap();
        assert_eq!(out.data, br#"{"a":2,"b":1}"#);
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(Json.mill(b"not json", "doc.json").is_err());
    }
}
