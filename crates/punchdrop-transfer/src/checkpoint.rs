//! Resumable-transfer checkpoint, stored as a sidecar next to the output
//! file.
//!
//! ```text
//! [0..4]   Magic 0x50325052 ("P2PR")
//! [4..8]   Version (1)
//! [8..16]  File size (u64)
//! [16..48] SHA-256 of the full source
//! [48..56] Bytes written so far (u64)
//! [56..58] Filename length (u16)
//! [58..]   Filename (UTF-8)
//! ```
//!
//! Rewrites go through a temp file and rename, so a crash mid-checkpoint
//! leaves the previous checkpoint intact.

use std::io;
use std::path::{Path, PathBuf};

use punchdrop_proto::metadata::FileMetadata;

pub const CHECKPOINT_SUFFIX: &str = ".p2p-partial";

const MAGIC: u32 = 0x5032_5052;
const VERSION: u32 = 1;
const FIXED_SIZE: usize = 4 + 4 + 8 + 32 + 8 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub file_size: u64,
    pub sha256: [u8; 32],
    pub bytes_written: u64,
    pub filename: String,
}

impl Checkpoint {
    /// Sidecar path for a given output file.
    pub fn path_for(output: &Path) -> PathBuf {
        let mut name = output
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(CHECKPOINT_SUFFIX);
        output.with_file_name(name)
    }

    /// Write the checkpoint atomically (temp file + rename).
    pub fn save(&self, output: &Path) -> io::Result<()> {
        let name = self.filename.as_bytes();
        let mut buf = Vec::with_capacity(FIXED_SIZE + name.len());
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf.extend_from_slice(&self.sha256);
        buf.extend_from_slice(&self.bytes_written.to_be_bytes());
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(name);

        let path = Checkpoint::path_for(output);
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &path)
    }

    /// Load the sidecar, or `None` when missing or unreadable.
    pub fn load(output: &Path) -> Option<Checkpoint> {
        let data = std::fs::read(Checkpoint::path_for(output)).ok()?;
        if data.len() < FIXED_SIZE {
            return None;
        }
        let magic = u32::from_be_bytes(data[0..4].try_into().ok()?);
        let version = u32::from_be_bytes(data[4..8].try_into().ok()?);
        if magic != MAGIC || version != VERSION {
            return None;
        }
        let file_size = u64::from_be_bytes(data[8..16].try_into().ok()?);
        let sha256: [u8; 32] = data[16..48].try_into().ok()?;
        let bytes_written = u64::from_be_bytes(data[48..56].try_into().ok()?);
        let name_len = u16::from_be_bytes(data[56..58].try_into().ok()?) as usize;
        if data.len() < FIXED_SIZE + name_len {
            return None;
        }
        let filename = std::str::from_utf8(&data[58..58 + name_len]).ok()?.to_string();
        Some(Checkpoint {
            file_size,
            sha256,
            bytes_written,
            filename,
        })
    }

    /// Remove the sidecar if present.
    pub fn delete(output: &Path) {
        let _ = std::fs::remove_file(Checkpoint::path_for(output));
    }

    /// A checkpoint matches an offer when filename, size, and digest all
    /// agree — anything else is a stale leftover.
    pub fn matches(&self, offer: &FileMetadata) -> bool {
        self.filename == offer.filename
            && self.file_size == offer.file_size
            && self.sha256 == offer.sha256
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_output(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "punchdrop-checkpoint-{}-{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("output.bin")
    }

    fn sample(filename: &str) -> Checkpoint {
        Checkpoint {
            file_size: 100_000,
            sha256: [0x5A; 32],
            bytes_written: 42_000,
            filename: filename.to_string(),
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let output = temp_output("roundtrip");
        let checkpoint = sample("output.bin");
        checkpoint.save(&output).unwrap();
        assert_eq!(Checkpoint::load(&output).unwrap(), checkpoint);
        Checkpoint::delete(&output);
        assert!(Checkpoint::load(&output).is_none());
    }

    #[test]
    fn sidecar_sits_next_to_output() {
        let path = Checkpoint::path_for(Path::new("/data/out/video.mkv"));
        assert_eq!(path, Path::new("/data/out/video.mkv.p2p-partial"));
    }

    #[test]
    fn corrupt_sidecar_ignored() {
        let output = temp_output("corrupt");
        std::fs::write(Checkpoint::path_for(&output), b"short").unwrap();
        assert!(Checkpoint::load(&output).is_none());
        Checkpoint::delete(&output);
    }

    #[test]
    fn matches_requires_all_fields() {
        let checkpoint = sample("f.bin");
        let offer = FileMetadata {
            transfer_id: Uuid::new_v4(),
            file_size: 100_000,
            sha256: [0x5A; 32],
            filename: "f.bin".to_string(),
        };
        assert!(checkpoint.matches(&offer));

        let mut wrong_size = offer.clone();
        wrong_size.file_size = 1;
        assert!(!checkpoint.matches(&wrong_size));

        let mut wrong_hash = offer.clone();
        wrong_hash.sha256 = [0; 32];
        assert!(!checkpoint.matches(&wrong_hash));

        let mut wrong_name = offer;
        wrong_name.filename = "other.bin".to_string();
        assert!(!checkpoint.matches(&wrong_name));
    }
}
