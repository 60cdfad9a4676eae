//! Reliable, ordered delivery over the packet router.
//!
//! Wires the RTT estimator, congestion control, send window and receive
//! buffer together under a single lock, and registers DATA/SACK handlers and
//! a retransmission tick with the router. Sits between the router (network
//! I/O) and the file-transfer layer.
//!
//! Threading: `send_data`/`send_control` are called from application threads;
//! the data, SACK and tick paths run on the router thread. The channel lock
//! is the only synchronization between them. Data and control callbacks are
//! invoked on the router thread.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;

use punchdrop_proto::packet::{Packet, PacketType, HEADER_SIZE};
use punchdrop_proto::sack::SackInfo;

use crate::congestion::CongestionControl;
use crate::recv_buffer::ReceiveBuffer;
use crate::router::PacketRouter;
use crate::rtt::RttEstimator;
use crate::send_window::SendWindow;

/// DATA subheader: 4 bytes chunk index + 8 bytes byte offset.
pub const DATA_HEADER_SIZE: usize = 12;

/// Conservative default chunk size, safe under any DTLS cipher overhead.
pub const DEFAULT_MAX_CHUNK_DATA: usize = 1100;

const CONTROL_TYPES: [PacketType; 6] = [
    PacketType::FileOffer,
    PacketType::FileAccept,
    PacketType::FileReject,
    PacketType::Complete,
    PacketType::Verified,
    PacketType::Cancel,
];

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
}

/// Parsed DATA packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub chunk_index: u32,
    pub byte_offset: u64,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct ChannelStats {
    packets_sent: u64,
    packets_received: u64,
    retransmissions: u64,
    sacks_received: u64,
    ticks: u64,
}

struct ChannelState {
    rtt: RttEstimator,
    congestion: CongestionControl,
    send_window: SendWindow,
    recv_buffer: ReceiveBuffer,
    recv_initialized: bool,
    receiver_window: usize,
    closed: bool,
    stats: ChannelStats,
}

type DataCallback = Box<dyn Fn(DataPayload) + Send + Sync>;
type ControlCallback = Box<dyn Fn(Packet) + Send + Sync>;
type AllAckedCallback = Box<dyn Fn() + Send + Sync>;

struct ChannelInner {
    router: PacketRouter,
    connection_id: u32,
    max_chunk_data: usize,
    state: Mutex<ChannelState>,
    window_available: Condvar,
    on_data: Mutex<Option<DataCallback>>,
    on_control: Mutex<Option<ControlCallback>>,
    on_all_acked: Mutex<Option<AllAckedCallback>>,
}

/// Reliable channel over the router. Cheap to clone.
#[derive(Clone)]
pub struct ReliableChannel {
    inner: Arc<ChannelInner>,
}

impl ReliableChannel {
    /// Create a channel and register its DATA/SACK handlers and tick with
    /// the router. `send_limit` is the largest datagram the underlying
    /// secure transport accepts.
    pub fn new(router: PacketRouter, connection_id: u32, send_limit: usize) -> ReliableChannel {
        let max_chunk_data = send_limit - HEADER_SIZE - DATA_HEADER_SIZE;
        let initial_seq = OsRng.next_u32();

        let inner = Arc::new(ChannelInner {
            router: router.clone(),
            connection_id,
            max_chunk_data,
            state: Mutex::new(ChannelState {
                rtt: RttEstimator::new(),
                congestion: CongestionControl::new(),
                send_window: SendWindow::new(initial_seq),
                recv_buffer: ReceiveBuffer::new(0), // re-initialized on first DATA
                recv_initialized: false,
                receiver_window: 256,
                closed: false,
                stats: ChannelStats::default(),
            }),
            window_available: Condvar::new(),
            on_data: Mutex::new(None),
            on_control: Mutex::new(None),
            on_all_acked: Mutex::new(None),
        });

        debug!(
            "reliable channel created: send_limit={}, max_chunk_data={}",
            send_limit, max_chunk_data
        );

        let data_inner = inner.clone();
        router.add_handler(PacketType::Data, move |pkt| handle_data(&data_inner, pkt));
        let sack_inner = inner.clone();
        router.add_handler(PacketType::Sack, move |pkt| handle_sack(&sack_inner, pkt));
        let tick_inner = inner.clone();
        router.set_tick_callback(move || on_tick(&tick_inner));

        ReliableChannel { inner }
    }

    /// Channel with the conservative default chunk size.
    pub fn with_default_limit(router: PacketRouter, connection_id: u32) -> ReliableChannel {
        ReliableChannel::new(
            router,
            connection_id,
            DEFAULT_MAX_CHUNK_DATA + HEADER_SIZE + DATA_HEADER_SIZE,
        )
    }

    /// Callback for in-order received data. Runs on the router thread.
    pub fn on_data_received<F>(&self, handler: F)
    where
        F: Fn(DataPayload) + Send + Sync + 'static,
    {
        *self.inner.on_data.lock() = Some(Box::new(handler));
    }

    /// Callback for control packets (FILE_OFFER, FILE_ACCEPT, FILE_REJECT,
    /// COMPLETE, VERIFIED, CANCEL). Runs on the router thread.
    pub fn on_control_packet<F>(&self, handler: F)
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        *self.inner.on_control.lock() = Some(Box::new(handler));
        for packet_type in CONTROL_TYPES {
            let inner = self.inner.clone();
            self.inner.router.add_handler(packet_type, move |pkt| {
                let cb = inner.on_control.lock();
                if let Some(cb) = cb.as_ref() {
                    cb(pkt);
                }
            });
        }
    }

    /// Callback invoked when every in-flight packet has been acknowledged.
    pub fn on_all_acked<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_all_acked.lock() = Some(Box::new(handler));
    }

    /// Send a DATA packet. Blocks while the send window is full
    /// (backpressure); wakes when SACKs drain the window or the channel
    /// closes.
    pub fn send_data(
        &self,
        chunk_index: u32,
        byte_offset: u64,
        data: &[u8],
    ) -> Result<(), ChannelError> {
        let mut payload = Vec::with_capacity(DATA_HEADER_SIZE + data.len());
        payload.extend_from_slice(&chunk_index.to_be_bytes());
        payload.extend_from_slice(&byte_offset.to_be_bytes());
        payload.extend_from_slice(data);

        let encoded = {
            let mut state = self.inner.state.lock();
            loop {
                if state.closed {
                    return Err(ChannelError::Closed);
                }
                let window = state.congestion.effective_window(state.receiver_window);
                if state.send_window.can_send(window) {
                    break;
                }
                self.inner.window_available.wait(&mut state);
            }

            let now = Instant::now();
            let seq = state.send_window.next_seq();
            let packet = Packet::with_header(
                PacketType::Data,
                0,
                self.inner.connection_id,
                seq,
                payload,
            );
            let encoded = packet.encode();
            state.send_window.track(encoded.clone(), now);
            state.stats.packets_sent += 1;
            encoded
        };

        self.inner.router.send(encoded).map_err(|_| ChannelError::Closed)
    }

    /// Send a control packet — not windowed, not acked at this layer.
    pub fn send_control(&self, packet: &Packet) -> Result<(), ChannelError> {
        if self.inner.state.lock().closed {
            return Err(ChannelError::Closed);
        }
        self.inner
            .router
            .send_packet(packet)
            .map_err(|_| ChannelError::Closed)
    }

    /// Close the channel: unregister from the router, wake blocked senders,
    /// abandon the send window.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.router.remove_handler(PacketType::Data);
        self.inner.router.remove_handler(PacketType::Sack);
        for packet_type in CONTROL_TYPES {
            self.inner.router.remove_handler(packet_type);
        }
        self.inner.router.clear_tick_callback();
        self.inner.window_available.notify_all();
    }

    /// Max file bytes per DATA packet (accounts for header overhead).
    pub fn max_chunk_data(&self) -> usize {
        self.inner.max_chunk_data
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.state.lock().send_window.inflight_count()
    }

    pub fn packets_sent(&self) -> u64 {
        self.inner.state.lock().stats.packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.inner.state.lock().stats.packets_received
    }

    pub fn retransmissions(&self) -> u64 {
        self.inner.state.lock().stats.retransmissions
    }

    pub fn sacks_received(&self) -> u64 {
        self.inner.state.lock().stats.sacks_received
    }

    pub fn cwnd(&self) -> usize {
        self.inner.state.lock().congestion.window_size()
    }

    pub fn rto(&self) -> std::time::Duration {
        self.inner.state.lock().rtt.rto()
    }
}

fn parse_data_payload(bytes: &[u8]) -> Option<DataPayload> {
    if bytes.len() < DATA_HEADER_SIZE {
        return None;
    }
    Some(DataPayload {
        chunk_index: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
        byte_offset: u64::from_be_bytes(bytes[4..12].try_into().unwrap()),
        data: bytes[12..].to_vec(),
    })
}

fn handle_data(inner: &Arc<ChannelInner>, packet: Packet) {
    let seq = packet.sequence;
    let now = Instant::now();

    let (delivered, sack) = {
        let mut state = inner.state.lock();
        state.stats.packets_received += 1;

        // Both sides agree on the initial sequence by adopting the first
        // DATA packet's — no extra negotiation.
        if !state.recv_initialized {
            state.recv_buffer = ReceiveBuffer::new(seq);
            state.recv_initialized = true;
            debug!("receive buffer initialized with first seq={}", seq);
        }

        let delivered = state.recv_buffer.deliver(seq, packet.payload);
        let sack = if state.recv_buffer.should_send_ack(now) {
            let sack = state.recv_buffer.generate_sack();
            state.recv_buffer.ack_sent(now);
            Some(sack)
        } else {
            None
        };
        (delivered, sack)
    };

    {
        let on_data = inner.on_data.lock();
        if let Some(cb) = on_data.as_ref() {
            for (_, bytes) in &delivered {
                match parse_data_payload(bytes) {
                    Some(payload) => cb(payload),
                    None => debug!("DATA payload too short: {} bytes", bytes.len()),
                }
            }
        }
    }

    if let Some(sack) = sack {
        send_sack(inner, &sack);
    }
}

fn handle_sack(inner: &Arc<ChannelInner>, packet: Packet) {
    let sack = match SackInfo::decode(&packet.payload) {
        Ok(sack) => sack,
        Err(e) => {
            debug!("ignoring bad SACK payload: {}", e);
            return;
        }
    };

    let now = Instant::now();
    let mut retransmits: Vec<Vec<u8>> = Vec::new();

    let all_acked = {
        let mut state = inner.state.lock();
        state.stats.sacks_received += 1;

        let old_base = state.send_window.base_seq();
        let lost = state.send_window.process_sack(&sack);
        let new_base = state.send_window.base_seq();
        state.receiver_window = sack.receiver_window as usize;

        if new_base != old_base {
            // Cumulative edge advanced: sample RTT (Karn) and open the window.
            let acked = sack.cumulative_ack;
            if !state.send_window.was_retransmitted(acked) {
                if let Some(sent) = state.send_window.send_time(acked) {
                    state
                        .rtt
                        .add_sample(now.duration_since(sent).as_millis() as u64);
                }
            }
            state.congestion.on_ack();
        } else if !sack.ranges.is_empty() {
            // Duplicate ack: cumulative edge held but ranges are present.
            if state.congestion.on_duplicate_ack() {
                for seq in &lost {
                    if let Some(data) = state.send_window.data_for(*seq) {
                        state.send_window.mark_retransmitted(*seq, now);
                        state.stats.retransmissions += 1;
                        debug!("fast retransmit seq={}", seq);
                        retransmits.push(data);
                    }
                }
            }
        }

        state.send_window.inflight_count() == 0
    };

    // Wake anyone blocked on the window, then do I/O outside the lock.
    inner.window_available.notify_all();

    for data in retransmits {
        let _ = inner.router.send(data);
    }

    if all_acked {
        let on_all_acked = inner.on_all_acked.lock();
        if let Some(cb) = on_all_acked.as_ref() {
            cb();
        }
    }
}

fn on_tick(inner: &Arc<ChannelInner>) {
    let now = Instant::now();
    let mut retransmits: Vec<Vec<u8>> = Vec::new();

    let sack = {
        let mut state = inner.state.lock();
        state.stats.ticks += 1;
        if state.closed {
            return;
        }

        let rto = state.rtt.rto();
        for seq in state.send_window.retransmittable(now, rto) {
            if let Some(data) = state.send_window.data_for(seq) {
                state.send_window.mark_retransmitted(seq, now);
                state.rtt.backoff();
                state.congestion.on_loss();
                state.stats.retransmissions += 1;
                debug!("RTO retransmit seq={}", seq);
                retransmits.push(data);
            }
        }

        if state.recv_buffer.should_send_ack(now) {
            let sack = state.recv_buffer.generate_sack();
            state.recv_buffer.ack_sent(now);
            Some(sack)
        } else {
            None
        }
    };

    for data in retransmits {
        let _ = inner.router.send(data);
    }

    if let Some(sack) = sack {
        send_sack(inner, &sack);
    }
}

fn send_sack(inner: &Arc<ChannelInner>, sack: &SackInfo) {
    let packet = Packet::new(PacketType::Sack, sack.encode());
    if let Err(e) = inner.router.send_packet(&packet) {
        debug!("failed to send SACK: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_payload_roundtrip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u32.to_be_bytes());
        bytes.extend_from_slice(&987_654u64.to_be_bytes());
        bytes.extend_from_slice(b"chunk");
        let parsed = parse_data_payload(&bytes).unwrap();
        assert_eq!(parsed.chunk_index, 7);
        assert_eq!(parsed.byte_offset, 987_654);
        assert_eq!(parsed.data, b"chunk");
    }

    #[test]
    fn short_data_payload_rejected() {
        assert!(parse_data_payload(&[0u8; 11]).is_none());
    }

    #[test]
    fn max_chunk_data_accounts_for_headers() {
        let router = PacketRouter::new();
        let channel = ReliableChannel::new(router, 1, 1200);
        assert_eq!(channel.max_chunk_data(), 1200 - 20 - 12);
    }

    #[test]
    fn send_fails_after_close() {
        let router = PacketRouter::new();
        let channel = ReliableChannel::new(router, 1, 1200);
        channel.close();
        assert!(matches!(
            channel.send_data(0, 0, b"x"),
            Err(ChannelError::Closed)
        ));
        assert!(matches!(
            channel.send_control(&Packet::control(PacketType::Complete)),
            Err(ChannelError::Closed)
        ));
    }
}
