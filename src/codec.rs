//! Value encoding and block compression, injected into the engine at
//! construction instead of hardcoded, so a host can swap either without
//! touching storage logic.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::error::{LsmError, Result};

/// A structured, self-describing document. The engine never inspects it.
pub type Document = Value;

/// `encode(document) -> bytes` / `decode(bytes) -> document`.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &Document) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Document>;
}

/// `compress(bytes) -> bytes` / `decompress(bytes) -> bytes`.
pub trait Compressor: Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Default codec: plain JSON via `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &Document) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| LsmError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document> {
        serde_json::from_slice(bytes).map_err(|e| LsmError::Serialization(e.to_string()))
    }
}

/// Default compressor: DEFLATE via `flate2`.
#[derive(Debug, Clone, Copy)]
pub struct DeflateCompressor {
    level: Compression,
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Compressor for DeflateCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::new(), self.level);
        encoder.write_all(bytes)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let codec = JsonCodec;
        let doc = json!({"n": 1, "s": "hi"});
        let bytes = codec.encode(&doc).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), doc);
    }

    #[test]
    fn deflate_round_trip() {
        let compressor = DeflateCompressor::default();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let compressed = compressor.compress(&data).unwrap();
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }
}
