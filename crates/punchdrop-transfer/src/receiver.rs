//! File receiver: FILE_OFFER → FILE_ACCEPT → DATA writes → COMPLETE →
//! digest verification → VERIFIED.
//!
//! Supports resuming interrupted transfers through the `.p2p-partial`
//! sidecar. Disk writes run on the router thread (the data callback) under a
//! mutex that also serializes checkpoint rewrites.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use punchdrop_proto::metadata::{file_sha256, FileMetadata};
use punchdrop_proto::packet::{Packet, PacketType};
use punchdrop_transport::channel::{DataPayload, ReliableChannel};

use crate::checkpoint::Checkpoint;
use crate::latch::Latch;
use crate::progress::TransferProgress;
use crate::state::TransferState;
use crate::TransferError;

const OFFER_TIMEOUT: Duration = Duration::from_secs(120);
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(600);
const ZERO_FILE_COMPLETE_TIMEOUT: Duration = Duration::from_secs(30);
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);

struct DiskState {
    file: Option<std::fs::File>,
    output_path: Option<PathBuf>,
    file_size: u64,
    bytes_written: u64,
    last_checkpoint: Option<Instant>,
}

struct ReceiverShared {
    state: Mutex<TransferState>,
    metadata: Mutex<Option<FileMetadata>>,
    cancelled: AtomicBool,
    offer_latch: Latch,
    complete_latch: Latch,
    disk: Mutex<DiskState>,
    progress: Mutex<Option<Arc<TransferProgress>>>,
}

pub struct FileReceiver {
    output_dir: PathBuf,
    channel: ReliableChannel,
    shared: Arc<ReceiverShared>,
}

impl FileReceiver {
    /// Wire a receiver onto the channel. Registers the control and data
    /// callbacks immediately.
    pub fn new(output_dir: PathBuf, channel: ReliableChannel) -> FileReceiver {
        let shared = Arc::new(ReceiverShared {
            state: Mutex::new(TransferState::Waiting),
            metadata: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            offer_latch: Latch::new(),
            complete_latch: Latch::new(),
            disk: Mutex::new(DiskState {
                file: None,
                output_path: None,
                file_size: 0,
                bytes_written: 0,
                last_checkpoint: None,
            }),
            progress: Mutex::new(None),
        });

        let control_shared = shared.clone();
        channel.on_control_packet(move |packet| handle_control(&control_shared, packet));

        let data_shared = shared.clone();
        channel.on_data_received(move |payload| handle_data(&data_shared, payload));

        FileReceiver {
            output_dir,
            channel,
            shared,
        }
    }

    /// Run the receive flow. Blocks until the file is verified (returning
    /// its path) or the transfer fails.
    pub fn receive(&self) -> Result<PathBuf, TransferError> {
        info!("waiting for file offer");
        if !self.shared.offer_latch.wait_for(OFFER_TIMEOUT) {
            self.set_state(TransferState::Error);
            return Err(TransferError::Timeout("FILE_OFFER"));
        }
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(TransferError::Cancelled);
        }

        let metadata = match self.shared.metadata.lock().clone() {
            Some(metadata) => metadata,
            None => {
                self.set_state(TransferState::Error);
                return Err(TransferError::Timeout("FILE_OFFER"));
            }
        };

        // The offered filename is untrusted input.
        sanitize_filename(&metadata.filename)?;
        std::fs::create_dir_all(&self.output_dir)?;
        let output_path = self.output_dir.join(&metadata.filename);

        // Adopt a matching checkpoint; a stale one is simply ignored (a
        // fresh run will overwrite it).
        let mut resume_offset = 0u64;
        if let Some(checkpoint) = Checkpoint::load(&output_path) {
            if checkpoint.matches(&metadata) {
                resume_offset = checkpoint.bytes_written.min(metadata.file_size);
                info!("resuming transfer from offset {}", resume_offset);
            } else {
                debug!("ignoring stale checkpoint beside {:?}", output_path);
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&output_path)?;
        file.set_len(metadata.file_size)?;

        {
            let mut disk = self.shared.disk.lock();
            disk.file = Some(file);
            disk.output_path = Some(output_path.clone());
            disk.file_size = metadata.file_size;
            disk.bytes_written = resume_offset;
            disk.last_checkpoint = None;
        }

        let progress = Arc::new(TransferProgress::new(metadata.file_size));
        progress.update(resume_offset);
        *self.shared.progress.lock() = Some(progress);

        info!(
            "accepting file: {} ({} bytes) -> {:?}{}",
            metadata.filename,
            metadata.file_size,
            output_path,
            if resume_offset > 0 {
                format!(" (resuming from {})", resume_offset)
            } else {
                String::new()
            }
        );

        // Zero-byte file: no data phase at all.
        if metadata.file_size == 0 {
            self.close_file();
            self.send_accept(&metadata, resume_offset)?;
            self.set_state(TransferState::Verifying);
            info!("zero-byte file; skipping data transfer");
            if !self.shared.complete_latch.wait_for(ZERO_FILE_COMPLETE_TIMEOUT) {
                self.set_state(TransferState::Error);
                return Err(TransferError::Timeout("COMPLETE"));
            }
            return self.verify_and_finish(&metadata, &output_path);
        }

        self.send_accept(&metadata, resume_offset)?;
        self.set_state(TransferState::Receiving);

        if !self.shared.complete_latch.wait_for(COMPLETE_TIMEOUT) {
            self.set_state(TransferState::Error);
            self.persist_checkpoint(&metadata);
            self.close_file();
            return Err(TransferError::Timeout("COMPLETE"));
        }
        if self.shared.cancelled.load(Ordering::SeqCst) {
            self.persist_checkpoint(&metadata);
            self.close_file();
            return Err(TransferError::Cancelled);
        }

        self.set_state(TransferState::Verifying);
        self.close_file();
        self.verify_and_finish(&metadata, &output_path)
    }

    /// Notify the peer and abort locally, keeping the checkpoint.
    pub fn cancel(&self) {
        let _ = self
            .channel
            .send_control(&Packet::control(PacketType::Cancel));
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.set_state(TransferState::Cancelled);
        self.shared.offer_latch.open();
        self.shared.complete_latch.open();
    }

    pub fn state(&self) -> TransferState {
        *self.shared.state.lock()
    }

    /// Progress for the active transfer; `None` before the offer arrives.
    pub fn progress(&self) -> Option<Arc<TransferProgress>> {
        self.shared.progress.lock().clone()
    }

    pub fn metadata(&self) -> Option<FileMetadata> {
        self.shared.metadata.lock().clone()
    }

    fn send_accept(&self, metadata: &FileMetadata, resume_offset: u64) -> Result<(), TransferError> {
        let mut payload = Vec::with_capacity(24);
        payload.extend_from_slice(metadata.transfer_id.as_bytes());
        payload.extend_from_slice(&resume_offset.to_be_bytes());
        self.channel
            .send_control(&Packet::new(PacketType::FileAccept, payload))?;
        Ok(())
    }

    fn verify_and_finish(
        &self,
        metadata: &FileMetadata,
        output_path: &Path,
    ) -> Result<PathBuf, TransferError> {
        info!("verifying file integrity");
        let actual = file_sha256(output_path)?;
        if digest_eq(&actual, &metadata.sha256) {
            self.channel
                .send_control(&Packet::control(PacketType::Verified))?;
            Checkpoint::delete(output_path);
            self.set_state(TransferState::Done);
            info!("file verified; transfer complete: {:?}", output_path);
            Ok(output_path.to_path_buf())
        } else {
            // Keep the checkpoint and the output so the next attempt (or the
            // operator) can diagnose.
            self.persist_checkpoint(metadata);
            self.set_state(TransferState::Error);
            error!(
                "SHA-256 mismatch: expected {}, got {}",
                metadata.sha256_hex(),
                hex::encode(actual)
            );
            Err(TransferError::DigestMismatch {
                expected: metadata.sha256_hex(),
                actual: hex::encode(actual),
            })
        }
    }

    fn persist_checkpoint(&self, metadata: &FileMetadata) {
        let disk = self.shared.disk.lock();
        save_checkpoint(&disk, metadata);
    }

    fn close_file(&self) {
        self.shared.disk.lock().file = None;
    }

    fn set_state(&self, state: TransferState) {
        *self.shared.state.lock() = state;
    }
}

/// Write one delivered chunk at its byte offset; runs on the router thread.
fn handle_data(shared: &Arc<ReceiverShared>, payload: DataPayload) {
    let metadata = shared.metadata.lock().clone();
    let mut disk = shared.disk.lock();
    if disk.file.is_none() {
        return; // not accepting yet
    }

    // A chunk may never extend past the offered size.
    let end = payload.byte_offset + payload.data.len() as u64;
    if end > disk.file_size {
        warn!(
            "dropping DATA beyond offered size: offset {} + {} > {}",
            payload.byte_offset,
            payload.data.len(),
            disk.file_size
        );
        return;
    }

    let write = match disk.file.as_mut() {
        Some(file) => file
            .seek(SeekFrom::Start(payload.byte_offset))
            .and_then(|_| file.write_all(&payload.data)),
        None => return,
    };

    match write {
        Ok(()) => {
            disk.bytes_written += payload.data.len() as u64;
            if let Some(progress) = shared.progress.lock().as_ref() {
                progress.update(disk.bytes_written);
            }

            let due = disk
                .last_checkpoint
                .map(|at| at.elapsed() >= CHECKPOINT_INTERVAL)
                .unwrap_or(true);
            if due {
                if let Some(metadata) = &metadata {
                    save_checkpoint(&disk, metadata);
                }
                disk.last_checkpoint = Some(Instant::now());
            }
        }
        Err(e) => {
            error!("error writing data at offset {}: {}", payload.byte_offset, e);
            *shared.state.lock() = TransferState::Error;
        }
    }
}

fn save_checkpoint(disk: &DiskState, metadata: &FileMetadata) {
    let output_path = match &disk.output_path {
        Some(path) => path,
        None => return,
    };
    let checkpoint = Checkpoint {
        file_size: metadata.file_size,
        sha256: metadata.sha256,
        bytes_written: disk.bytes_written,
        filename: metadata.filename.clone(),
    };
    if let Err(e) = checkpoint.save(output_path) {
        debug!("failed to save checkpoint: {}", e);
    }
}

fn handle_control(shared: &Arc<ReceiverShared>, packet: Packet) {
    match packet.packet_type {
        PacketType::FileOffer => match FileMetadata::decode(&packet.payload) {
            Ok(metadata) => {
                info!(
                    "received FILE_OFFER: {} ({} bytes, SHA-256 {})",
                    metadata.filename,
                    metadata.file_size,
                    metadata.sha256_hex()
                );
                *shared.metadata.lock() = Some(metadata);
                shared.offer_latch.open();
            }
            Err(e) => warn!("bad FILE_OFFER payload: {}", e),
        },
        PacketType::Complete => {
            let written = shared.disk.lock().bytes_written;
            info!("received COMPLETE; bytes written {}", written);
            shared.complete_latch.open();
        }
        PacketType::Cancel => {
            warn!("transfer cancelled by sender");
            shared.cancelled.store(true, Ordering::SeqCst);
            *shared.state.lock() = TransferState::Cancelled;
            shared.offer_latch.open();
            shared.complete_latch.open();
        }
        other => debug!("receiver ignoring control packet {:?}", other),
    }
}

/// The offered filename must be a bare path component: no separators, no
/// parent references, no NUL, not empty.
fn sanitize_filename(name: &str) -> Result<(), TransferError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(TransferError::UnsafeFilename(name.to_string()));
    }
    Ok(())
}

/// Constant-time digest comparison.
fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
