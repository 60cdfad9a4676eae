//! File-transfer metadata, encoded as the FILE_OFFER payload.
//!
//! ```text
//! [0..16]  Transfer ID (UUID)
//! [16..24] File size (u64)
//! [24..56] SHA-256 of the whole file
//! [56..58] Filename length (u16)
//! [58..]   Filename (UTF-8)
//! ```

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::packet::PacketError;

const FIXED_SIZE: usize = 16 + 8 + 32 + 2;

/// Metadata describing one offered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub transfer_id: Uuid,
    pub file_size: u64,
    pub sha256: [u8; 32],
    pub filename: String,
}

impl FileMetadata {
    /// Build metadata for a file on disk, computing its SHA-256.
    pub fn from_file(path: &Path) -> io::Result<FileMetadata> {
        let file_size = path.metadata()?.len();
        let sha256 = file_sha256(path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file has no UTF-8 name"))?
            .to_string();
        Ok(FileMetadata {
            transfer_id: Uuid::new_v4(),
            file_size,
            sha256,
            filename,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = self.filename.as_bytes();
        let mut out = Vec::with_capacity(FIXED_SIZE + name.len());
        out.extend_from_slice(self.transfer_id.as_bytes());
        out.extend_from_slice(&self.file_size.to_be_bytes());
        out.extend_from_slice(&self.sha256);
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<FileMetadata, PacketError> {
        if payload.len() < FIXED_SIZE {
            return Err(PacketError::TruncatedPayload("file metadata"));
        }
        let transfer_id = Uuid::from_bytes(payload[0..16].try_into().unwrap());
        let file_size = u64::from_be_bytes(payload[16..24].try_into().unwrap());
        let sha256: [u8; 32] = payload[24..56].try_into().unwrap();
        let name_len = u16::from_be_bytes(payload[56..58].try_into().unwrap()) as usize;
        if payload.len() < FIXED_SIZE + name_len {
            return Err(PacketError::TruncatedPayload("file metadata"));
        }
        let filename = std::str::from_utf8(&payload[58..58 + name_len])
            .map_err(|_| PacketError::BadUtf8("filename"))?
            .to_string();
        Ok(FileMetadata {
            transfer_id,
            file_size,
            sha256,
            filename,
        })
    }

    /// Digest as lowercase hex for display.
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

/// Streaming SHA-256 of a whole file.
pub fn file_sha256(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileMetadata {
        FileMetadata {
            transfer_id: Uuid::new_v4(),
            file_size: 1_234_567,
            sha256: [0xAB; 32],
            filename: "report-final.pdf".to_string(),
        }
    }

    #[test]
    fn roundtrip() {
        let meta = sample();
        assert_eq!(FileMetadata::decode(&meta.encode()).unwrap(), meta);
    }

    #[test]
    fn empty_filename_roundtrips() {
        let mut meta = sample();
        meta.filename = String::new();
        assert_eq!(FileMetadata::decode(&meta.encode()).unwrap(), meta);
    }

    #[test]
    fn truncated_rejected() {
        let encoded = sample().encode();
        assert!(FileMetadata::decode(&encoded[..40]).is_err());
        assert!(FileMetadata::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut encoded = sample().encode();
        let off = encoded.len() - 1;
        encoded[off] = 0xFF;
        assert_eq!(
            FileMetadata::decode(&encoded),
            Err(PacketError::BadUtf8("filename"))
        );
    }

    #[test]
    fn file_digest_matches_known_vector() {
        let dir = std::env::temp_dir().join(format!("punchdrop-meta-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        let digest = file_sha256(&path).unwrap();
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        std::fs::remove_file(&path).ok();
    }
}
