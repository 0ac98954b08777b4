//! Payload codec: compact JSON, bzip2-compressed, base64 where the store
//! needs printable bodies.
//!
//! Every store shares this codec so snapshots written through one driver
//! can be read back through another.

use crate::error::StoreError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Upper bound for one compressed record body. The KV-table backend caps
/// items at 400 KiB; the other stores enforce the same bound so a snapshot
/// never becomes backend-specific.
pub const MAX_RECORD_BYTES: usize = 400 * 1024;

/// Serialize as compact JSON and compress.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let json =
        serde_json::to_vec(value).map_err(|e| StoreError::Codec(format!("serialize: {e}")))?;
    compress(&json)
}

/// Decompress and deserialize.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = decompress(bytes)?;
    serde_json::from_slice(&json).map_err(|e| StoreError::Codec(format!("deserialize: {e}")))
}

/// bzip2-compress raw bytes.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| StoreError::Codec(format!("compress: {e}")))
}

/// Decompress bzip2 bytes.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = BzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StoreError::Codec(format!("decompress: {e}")))?;
    Ok(out)
}

/// Printable form for stores that cannot hold raw bytes.
pub fn to_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Reverse of [`to_base64`].
pub fn from_base64(text: &str) -> Result<Vec<u8>, StoreError> {
    BASE64
        .decode(text.trim())
        .map_err(|e| StoreError::Codec(format!("base64: {e}")))
}

/// Enforce the per-record size cap, naming the offending record.
pub fn check_record_size(name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    if bytes.len() > MAX_RECORD_BYTES {
        return Err(StoreError::RecordTooLarge {
            name: name.to_string(),
            size: bytes.len(),
            limit: MAX_RECORD_BYTES,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_round_trip() {
        let payload = json!({
            "host": "web1",
            "tags": [{"tag": "env", "value": "prod"}],
            "unicode": "日本語テキスト",
        });
        let bytes = encode(&payload).unwrap();
        let back: serde_json::Value = decode(&bytes).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn compression_shrinks_repetitive_payloads() {
        let text = "interface ".repeat(4096);
        let compressed = compress(text.as_bytes()).unwrap();
        assert!(compressed.len() < text.len() / 4);
        assert_eq!(decompress(&compressed).unwrap(), text.as_bytes());
    }

    #[test]
    fn base64_round_trip() {
        let bytes = compress(b"payload body").unwrap();
        let text = to_base64(&bytes);
        assert_eq!(from_base64(&text).unwrap(), bytes);
    }

    #[test]
    fn garbage_input_is_a_codec_error() {
        assert!(decompress(b"not bzip2 at all").is_err());
        assert!(from_base64("!!!").is_err());
    }

    #[test]
    fn oversize_records_are_named() {
        let big = vec![0u8; MAX_RECORD_BYTES + 1];
        let err = check_record_size("host/web1", &big).unwrap_err();
        match err {
            StoreError::RecordTooLarge { name, .. } => assert_eq!(name, "host/web1"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
