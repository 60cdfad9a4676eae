//! File sender: FILE_OFFER → FILE_ACCEPT → DATA pump → COMPLETE → VERIFIED.
//!
//! `send` blocks the calling thread; control packets arrive on the router
//! thread and release the latches it waits on. Backpressure comes from
//! [`ReliableChannel::send_data`], which suspends when the send window is
//! full.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use punchdrop_proto::metadata::FileMetadata;
use punchdrop_proto::packet::{Packet, PacketType};
use punchdrop_transport::channel::ReliableChannel;
use uuid::Uuid;

use crate::latch::Latch;
use crate::progress::TransferProgress;
use crate::state::TransferState;
use crate::TransferError;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const ALL_ACKED_TIMEOUT: Duration = Duration::from_secs(60);

struct SenderShared {
    transfer_id: Uuid,
    state: Mutex<TransferState>,
    resume_offset: Mutex<u64>,
    pump_complete: AtomicBool,
    rejected: AtomicBool,
    cancelled: AtomicBool,
    accept_latch: Latch,
    verified_latch: Latch,
    all_acked_latch: Latch,
}

pub struct FileSender {
    file: PathBuf,
    metadata: FileMetadata,
    channel: ReliableChannel,
    progress: Arc<TransferProgress>,
    shared: Arc<SenderShared>,
}

impl FileSender {
    /// Wire a sender onto the channel. Registers the control and all-acked
    /// callbacks immediately.
    pub fn new(file: PathBuf, metadata: FileMetadata, channel: ReliableChannel) -> FileSender {
        let shared = Arc::new(SenderShared {
            transfer_id: metadata.transfer_id,
            state: Mutex::new(TransferState::Offering),
            resume_offset: Mutex::new(0),
            pump_complete: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            accept_latch: Latch::new(),
            verified_latch: Latch::new(),
            all_acked_latch: Latch::new(),
        });

        let control_shared = shared.clone();
        channel.on_control_packet(move |packet| handle_control(&control_shared, packet));

        let acked_shared = shared.clone();
        channel.on_all_acked(move || {
            if acked_shared.pump_complete.load(Ordering::SeqCst) {
                acked_shared.all_acked_latch.open();
            }
        });

        FileSender {
            file,
            progress: Arc::new(TransferProgress::new(metadata.file_size)),
            metadata,
            channel,
            shared,
        }
    }

    /// Run the full send flow. Blocks until verified, cancelled, or failed.
    pub fn send(&self) -> Result<(), TransferError> {
        info!(
            "offering file: {} ({} bytes, SHA-256 {})",
            self.metadata.filename,
            self.metadata.file_size,
            self.metadata.sha256_hex()
        );
        let offer = Packet::new(PacketType::FileOffer, self.metadata.encode());
        self.channel.send_control(&offer)?;

        if !self.shared.accept_latch.wait_for(CONTROL_TIMEOUT) {
            self.set_state(TransferState::Error);
            return Err(TransferError::Timeout("FILE_ACCEPT"));
        }
        if self.shared.rejected.load(Ordering::SeqCst) {
            return Err(TransferError::Rejected);
        }
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(TransferError::Cancelled);
        }

        let resume_offset = *self.shared.resume_offset.lock();
        self.set_state(TransferState::Transferring);
        info!("transfer accepted; sending from offset {}", resume_offset);
        self.pump_data(resume_offset)?;
        self.shared.pump_complete.store(true, Ordering::SeqCst);

        // The last SACK may already have drained the window.
        if self.channel.inflight_count() == 0 {
            self.shared.all_acked_latch.open();
        }
        if !self.shared.all_acked_latch.wait_for(ALL_ACKED_TIMEOUT) {
            warn!("timed out waiting for all acks; proceeding to COMPLETE");
        }

        self.set_state(TransferState::Completing);
        let complete = Packet::new(PacketType::Complete, self.metadata.sha256.to_vec());
        self.channel.send_control(&complete)?;
        info!("all data sent; waiting for receiver verification");

        if !self.shared.verified_latch.wait_for(CONTROL_TIMEOUT) {
            self.set_state(TransferState::Error);
            return Err(TransferError::Timeout("VERIFIED"));
        }
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(TransferError::Cancelled);
        }

        self.set_state(TransferState::Done);
        info!("transfer complete; file verified by receiver");
        Ok(())
    }

    /// Notify the peer and abort locally.
    pub fn cancel(&self) {
        let _ = self
            .channel
            .send_control(&Packet::control(PacketType::Cancel));
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.set_state(TransferState::Cancelled);
        self.shared.accept_latch.open();
        self.shared.verified_latch.open();
        self.shared.all_acked_latch.open();
    }

    pub fn state(&self) -> TransferState {
        *self.shared.state.lock()
    }

    pub fn progress(&self) -> Arc<TransferProgress> {
        self.progress.clone()
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    fn pump_data(&self, resume_offset: u64) -> Result<(), TransferError> {
        let chunk_size = self.channel.max_chunk_data();
        let mut file = File::open(&self.file)?;
        file.seek(SeekFrom::Start(resume_offset))?;

        let mut offset = resume_offset;
        let mut chunk_index = (resume_offset / chunk_size as u64) as u32;
        let mut buf = vec![0u8; chunk_size];

        while offset < self.metadata.file_size {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Err(TransferError::Cancelled);
            }
            let to_read = (self.metadata.file_size - offset).min(chunk_size as u64) as usize;
            file.read_exact(&mut buf[..to_read])?;

            self.channel.send_data(chunk_index, offset, &buf[..to_read])?;

            offset += to_read as u64;
            chunk_index = chunk_index.wrapping_add(1);
            self.progress.update(offset - resume_offset);
        }
        Ok(())
    }

    fn set_state(&self, state: TransferState) {
        *self.shared.state.lock() = state;
    }
}

fn handle_control(shared: &Arc<SenderShared>, packet: Packet) {
    match packet.packet_type {
        PacketType::FileAccept => {
            // Payload: 16-byte transfer id + 8-byte resume offset.
            if packet.payload.len() >= 24 {
                let id = Uuid::from_bytes(packet.payload[0..16].try_into().unwrap());
                if id != shared.transfer_id {
                    warn!(
                        "FILE_ACCEPT for unknown transfer {} (expected {}); ignoring",
                        id, shared.transfer_id
                    );
                    return;
                }
                let offset = u64::from_be_bytes(packet.payload[16..24].try_into().unwrap());
                *shared.resume_offset.lock() = offset;
                info!("received FILE_ACCEPT (resume offset {})", offset);
            } else {
                debug!("short FILE_ACCEPT payload: {} bytes", packet.payload.len());
            }
            shared.accept_latch.open();
        }
        PacketType::FileReject => {
            warn!("file transfer rejected by receiver");
            shared.rejected.store(true, Ordering::SeqCst);
            *shared.state.lock() = TransferState::Cancelled;
            shared.accept_latch.open();
        }
        PacketType::Verified => {
            info!("received VERIFIED from receiver");
            shared.verified_latch.open();
        }
        PacketType::Cancel => {
            warn!("transfer cancelled by receiver");
            shared.cancelled.store(true, Ordering::SeqCst);
            *shared.state.lock() = TransferState::Cancelled;
            shared.accept_latch.open();
            shared.verified_latch.open();
            shared.all_acked_latch.open();
        }
        other => debug!("sender ignoring control packet {:?}", other),
    }
}
