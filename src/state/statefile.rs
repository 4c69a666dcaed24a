//! Framed, optionally compressed state files
//!
//! Layout: `magic(8) ∥ version(u32) ∥ flags(u32) ∥ compression(u8) ∥
//! payload ∥ crc32(4)`. The checksum covers everything before it. Files are
//! committed with a temp-file rename so a partial write is never visible
//! under the final name.

use crate::errors::StateError;
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
};

pub const MAGIC: [u8; 8] = *b"SBOXIMG\0";
pub const VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 4 + 4 + 1;
const TRAILER_LEN: usize = 4;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum CompressionLevel {
    None,
    #[default]
    FlateBestSpeed,
    FlateDefault,
}

impl CompressionLevel {
    fn tag(self) -> u8 {
        match self {
            CompressionLevel::None => 0,
            CompressionLevel::FlateBestSpeed => 1,
            CompressionLevel::FlateDefault => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<CompressionLevel, StateError> {
        match tag {
            0 => Ok(CompressionLevel::None),
            1 => Ok(CompressionLevel::FlateBestSpeed),
            2 => Ok(CompressionLevel::FlateDefault),
            other => Err(StateError::Corruption(format!(
                "unknown compression tag {}",
                other
            ))),
        }
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Frames and commits `payload` to `path`.
pub fn write(path: &Path, compression: CompressionLevel, payload: &[u8]) -> Result<(), StateError> {
    let mut image = Vec::with_capacity(HEADER_LEN + payload.len() / 2 + TRAILER_LEN);
    image.extend_from_slice(&MAGIC);
    image.extend_from_slice(&VERSION.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.push(compression.tag());
    match compression {
        CompressionLevel::None => image.extend_from_slice(payload),
        CompressionLevel::FlateBestSpeed | CompressionLevel::FlateDefault => {
            let level = if compression == CompressionLevel::FlateBestSpeed {
                Compression::fast()
            } else {
                Compression::default()
            };
            let mut encoder = DeflateEncoder::new(&mut image, level);
            encoder
                .write_all(payload)
                .and_then(|_| encoder.finish().map(|_| ()))
                .map_err(|e| io_err(path, e))?;
        }
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&image);
    image.extend_from_slice(&hasher.finalize().to_le_bytes());

    // write nearby, then rename into place
    let temp = temp_path(path);
    fs::write(&temp, &image).map_err(|e| io_err(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| io_err(path, e))?;
    log::debug!(
        "wrote state file {:?} ({} bytes, {:?})",
        path,
        image.len(),
        compression
    );
    Ok(())
}

/// Reads, verifies, and decompresses a state file's payload.
pub fn read(path: &Path) -> Result<Vec<u8>, StateError> {
    let image = fs::read(path).map_err(|e| io_err(path, e))?;
    if image.len() < HEADER_LEN + TRAILER_LEN {
        return Err(StateError::Truncated);
    }
    let (body, trailer) = image.split_at(image.len() - TRAILER_LEN);
    let stored_crc = u32::from_le_bytes(trailer.try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(StateError::ChecksumMismatch);
    }
    if body[..8] != MAGIC {
        return Err(StateError::Corruption("bad magic".to_string()));
    }
    let version = u32::from_le_bytes(body[8..12].try_into().unwrap());
    if version != VERSION {
        return Err(StateError::Corruption(format!(
            "unsupported version {}",
            version
        )));
    }
    let compression = CompressionLevel::from_tag(body[16])?;
    let payload = &body[HEADER_LEN..];
    match compression {
        CompressionLevel::None => Ok(payload.to_vec()),
        CompressionLevel::FlateBestSpeed | CompressionLevel::FlateDefault => {
            let mut decoded = Vec::new();
            DeflateDecoder::new(payload)
                .read_to_end(&mut decoded)
                .map_err(|_| StateError::Truncated)?;
            Ok(decoded)
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> PathBuf {
        let dir = std::env::var_os("TEST_TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        dir.join(format!("statefile-{}-{}", std::process::id(), name))
    }

    #[test]
    fn round_trip_all_levels() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        for level in [
            CompressionLevel::None,
            CompressionLevel::FlateBestSpeed,
            CompressionLevel::FlateDefault,
        ] {
            let path = temp_file(&format!("roundtrip-{:?}", level));
            write(&path, level, &payload).unwrap();
            assert_eq!(read(&path).unwrap(), payload);
            std::fs::remove_file(&path).unwrap();
        }
    }

    #[test]
    fn compression_shrinks_redundant_payloads() {
        let payload = vec![7u8; 1 << 20];
        let plain = temp_file("plain");
        let packed = temp_file("packed");
        write(&plain, CompressionLevel::None, &payload).unwrap();
        write(&packed, CompressionLevel::FlateBestSpeed, &payload).unwrap();
        let plain_len = std::fs::metadata(&plain).unwrap().len();
        let packed_len = std::fs::metadata(&packed).unwrap().len();
        assert!(packed_len < plain_len / 10);
        std::fs::remove_file(&plain).unwrap();
        std::fs::remove_file(&packed).unwrap();
    }

    #[test]
    fn corruption_is_detected() {
        let path = temp_file("corrupt");
        write(&path, CompressionLevel::None, b"precious state").unwrap();
        let mut image = std::fs::read(&path).unwrap();
        let mid = image.len() / 2;
        image[mid] ^= 0xff;
        std::fs::write(&path, &image).unwrap();
        assert!(matches!(read(&path), Err(StateError::ChecksumMismatch)));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn truncation_is_detected() {
        let path = temp_file("truncated");
        assert!(matches!(
            std::fs::write(&path, b"short").map(|_| read(&path)),
            Ok(Err(StateError::Truncated))
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn wrong_magic_is_corruption() {
        let path = temp_file("magic");
        write(&path, CompressionLevel::None, b"payload").unwrap();
        let mut image = std::fs::read(&path).unwrap();
        image[0] = b'X';
        // refresh the crc so only the magic is wrong
        let body_len = image.len() - 4;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&image[..body_len]);
        let crc = hasher.finalize().to_le_bytes();
        image[body_len..].copy_from_slice(&crc);
        std::fs::write(&path, &image).unwrap();
        match read(&path) {
            Err(StateError::Corruption(msg)) => assert!(msg.contains("magic")),
            other => panic!("expected corruption, got {:?}", other),
        }
        std::fs::remove_file(&path).unwrap();
    }
}
