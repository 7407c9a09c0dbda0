//! Message body encoding: JSON, optionally Brotli-compressed.

use crate::error::{PipelineError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Brotli quality used for message bodies (fastest setting that still compresses).
pub const BROTLI_QUALITY: u32 = 1;
/// Brotli sliding window (log2 bytes).
pub const BROTLI_WINDOW: u32 = 22;

const BUFFER_SIZE: usize = 4096;

/// Compress bytes with Brotli.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut writer = brotli::CompressorWriter::new(Vec::new(), BUFFER_SIZE, BROTLI_QUALITY, BROTLI_WINDOW);
    writer
        .write_all(data)
        .map_err(|e| PipelineError::Compression(format!("brotli encode: {}", e)))?;
    writer
        .flush()
        .map_err(|e| PipelineError::Compression(format!("brotli flush: {}", e)))?;
    Ok(writer.into_inner())
}

/// Decompress a Brotli stream.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = brotli::Decompressor::new(data, BUFFER_SIZE);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::Compression(format!("brotli decode: {}", e)))?;
    Ok(out)
}

/// Serialize to JSON and compress when asked.
pub fn encode<T: Serialize + ?Sized>(payload: &T, compressed: bool) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(payload)?;
    if compressed {
        compress(&json)
    } else {
        Ok(json)
    }
}

/// Inverse of [`encode`].
pub fn decode<T: DeserializeOwned>(body: &[u8], compressed: bool) -> Result<T> {
    if compressed {
        let json = decompress(body)?;
        Ok(serde_json::from_slice(&json)?)
    } else {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        key: String,
        values: Vec<u32>,
    }

    #[test]
    fn test_compressed_body_is_smaller_for_repetitive_json() {
        let payload = Payload {
            key: "billing".repeat(50),
            values: vec![7; 500],
        };
        let plain = encode(&payload, false).unwrap();
        let packed = encode(&payload, true).unwrap();

        assert!(packed.len() < plain.len() / 4);
        assert_eq!(decode::<Payload>(&packed, true).unwrap(), payload);
    }

    #[test]
    fn test_decode_plain_json() {
        let body = br#"{"key":"a","values":[1,2]}"#;
        let decoded: Payload = decode(body, false).unwrap();
        assert_eq!(decoded.values, vec![1, 2]);
    }

    #[test]
    fn test_corrupt_brotli_is_error() {
        let garbage = [0x11u8, 0x00, 0x13, 0x37, 0xDE, 0xAD];
        let result = decompress(&garbage);
        assert!(matches!(result, Err(PipelineError::Compression(_))));
    }

    #[test]
    fn test_decode_wrong_shape_is_serialization_error() {
        let body = encode(&vec![1, 2, 3], true).unwrap();
        let result = decode::<Payload>(&body, true);
        assert!(matches!(result, Err(PipelineError::Serialization(_))));
    }
}
