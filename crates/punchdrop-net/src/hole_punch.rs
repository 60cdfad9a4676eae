//! UDP hole puncher.
//!
//! Both peers run this simultaneously after PEER_INFO:
//! 1. Send a PUNCH to the remote endpoint every `punch_interval`.
//! 2. Read one datagram (the read timeout equals the interval; timeouts are
//!    normal).
//! 3. Drop datagrams from other IPs. Same IP, different port: adopt the
//!    observed port (symmetric-NAT adaptation).
//! 4. A received PUNCH proves bidirectional reachability — reply PUNCH_ACK
//!    and succeed immediately (the other side may already have moved on).
//!    A received PUNCH_ACK also succeeds.
//! 5. Deadline elapsed: failure.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use punchdrop_proto::packet::{looks_like_packet, Packet, PacketType, MAX_DATAGRAM};

const DEFAULT_PUNCH_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a hole-punch attempt.
#[derive(Debug, Clone, Copy)]
pub struct HolePunchResult {
    pub success: bool,
    pub confirmed_endpoint: Option<SocketAddr>,
    pub elapsed: Duration,
}

impl HolePunchResult {
    fn succeeded(endpoint: SocketAddr, elapsed: Duration) -> HolePunchResult {
        HolePunchResult {
            success: true,
            confirmed_endpoint: Some(endpoint),
            elapsed,
        }
    }

    fn failed(elapsed: Duration) -> HolePunchResult {
        HolePunchResult {
            success: false,
            confirmed_endpoint: None,
            elapsed,
        }
    }
}

pub struct HolePuncher<'a> {
    socket: &'a UdpSocket,
    remote_endpoint: SocketAddr,
    connection_id: u32,
    punch_interval: Duration,
    timeout: Duration,
}

impl<'a> HolePuncher<'a> {
    pub fn new(
        socket: &'a UdpSocket,
        remote_endpoint: SocketAddr,
        connection_id: u32,
    ) -> HolePuncher<'a> {
        HolePuncher::with_timing(
            socket,
            remote_endpoint,
            connection_id,
            DEFAULT_PUNCH_INTERVAL,
            DEFAULT_TIMEOUT,
        )
    }

    pub fn with_timing(
        socket: &'a UdpSocket,
        remote_endpoint: SocketAddr,
        connection_id: u32,
        punch_interval: Duration,
        timeout: Duration,
    ) -> HolePuncher<'a> {
        HolePuncher {
            socket,
            remote_endpoint,
            connection_id,
            punch_interval,
            timeout,
        }
    }

    /// Run the punch loop. Blocks until success or the deadline.
    pub fn punch(&mut self) -> HolePunchResult {
        let start = Instant::now();
        let deadline = start + self.timeout;

        info!(
            "starting hole punch to {} (conn_id={:#010x}, interval={:?}, timeout={:?})",
            self.remote_endpoint, self.connection_id, self.punch_interval, self.timeout
        );

        if let Err(e) = self.socket.set_read_timeout(Some(self.punch_interval)) {
            warn!("hole punch: failed to set read timeout: {}", e);
            return HolePunchResult::failed(start.elapsed());
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        let mut next_punch = Instant::now(); // send immediately
        let mut punches_sent = 0u32;
        let mut packets_received = 0u32;
        let mut timeouts = 0u32;

        while Instant::now() < deadline {
            if Instant::now() >= next_punch {
                if let Err(e) = self.send_punch() {
                    warn!("hole punch send error: {}", e);
                    return HolePunchResult::failed(start.elapsed());
                }
                punches_sent += 1;
                next_punch = Instant::now() + self.punch_interval;
            }

            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    timeouts += 1;
                    if timeouts % 20 == 0 {
                        info!(
                            "hole punch: sent={}, received={}, timeouts={}, elapsed={:?}",
                            punches_sent,
                            packets_received,
                            timeouts,
                            start.elapsed()
                        );
                    }
                    continue;
                }
                Err(e) => {
                    warn!("hole punch receive error: {}", e);
                    return HolePunchResult::failed(start.elapsed());
                }
            };

            packets_received += 1;

            // Only the expected remote IP counts; any port is accepted so a
            // symmetric NAT's per-destination remapping still gets through.
            if from.ip() != self.remote_endpoint.ip() {
                debug!(
                    "ignoring packet from unexpected source {} (expected {})",
                    from,
                    self.remote_endpoint.ip()
                );
                continue;
            }
            if from.port() != self.remote_endpoint.port() {
                info!(
                    "symmetric NAT detected: expected port {}, got {}; updating remote endpoint",
                    self.remote_endpoint.port(),
                    from.port()
                );
                self.remote_endpoint = from;
            }

            if !looks_like_packet(&buf[..len]) {
                debug!("ignoring stray datagram during hole punch ({} bytes)", len);
                continue;
            }
            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("ignoring bad packet during hole punch: {}", e);
                    continue;
                }
            };

            match packet.packet_type {
                PacketType::Punch => {
                    // Their PUNCH reached us, so our mapping is open both
                    // ways. Answer and succeed without waiting for the ack.
                    if let Err(e) = self.send_punch_ack(packet.connection_id) {
                        debug!("failed to send PUNCH_ACK: {}", e);
                    }
                    let elapsed = start.elapsed();
                    info!("hole punch succeeded in {:?} (received PUNCH from {})", elapsed, from);
                    return HolePunchResult::succeeded(from, elapsed);
                }
                PacketType::PunchAck => {
                    let elapsed = start.elapsed();
                    info!(
                        "hole punch succeeded in {:?} (received PUNCH_ACK from {})",
                        elapsed, from
                    );
                    return HolePunchResult::succeeded(from, elapsed);
                }
                other => debug!("ignoring {:?} during hole punch", other),
            }
        }

        let elapsed = start.elapsed();
        warn!(
            "hole punch timed out after {:?} (sent={}, received={}, timeouts={})",
            elapsed, punches_sent, packets_received, timeouts
        );
        HolePunchResult::failed(elapsed)
    }

    fn send_punch(&self) -> io::Result<()> {
        let punch = Packet::with_header(PacketType::Punch, 0, self.connection_id, 0, Vec::new());
        self.socket
            .send_to(&punch.encode(), self.remote_endpoint)
            .map(|_| ())
    }

    fn send_punch_ack(&self, echo_connection_id: u32) -> io::Result<()> {
        let ack = Packet::with_header(PacketType::PunchAck, 0, echo_connection_id, 0, Vec::new());
        self.socket
            .send_to(&ack.encode(), self.remote_endpoint)
            .map(|_| ())
    }
}
