//! Secure-transport establishment over the punched socket.
//!
//! The DTLS 1.2 PSK implementation itself is pluggable behind
//! [`HandshakeDriver`] (identity = session id bytes, key = PSK bytes; only
//! DTLS 1.2 may be offered). What lives here is everything around it:
//!
//! - deterministic role selection from the two *public* endpoints — both
//!   peers see the same pair, so the comparison cannot be inverted by NAT
//!   port remapping the way local-port comparison can;
//! - NAT priming: three `0x00` bytes before each attempt keep the mapping
//!   warm (`0x00` is neither a DTLS record type nor a framed packet);
//! - the retry envelope: up to 3 attempts with growing sleeps;
//! - [`HandshakeSource`], the datagram source a driver runs the handshake
//!   over: hard 30 s deadline independent of library-internal retries,
//!   source-address filtering, and in-handshake rejection of any datagram
//!   whose first byte is not a DTLS content type (0x14..=0x17) — those are
//!   stale PUNCH/PUNCH_ACK frames and priming bytes;
//! - [`UdpTransport`], the post-handshake source that only filters on the
//!   confirmed endpoint.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use punchdrop_proto::packet::MAX_DATAGRAM;
use punchdrop_transport::datagram::DatagramTransport;

const HANDSHAKE_ATTEMPTS: u32 = 3;
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);
const ATTEMPT_BACKOFF_STEP: Duration = Duration::from_millis(500);
const PRIMING_BYTES: usize = 3;

/// DTLS content types span ChangeCipherSpec (0x14) through AppData (0x17).
const DTLS_CONTENT_MIN: u8 = 0x14;
const DTLS_CONTENT_MAX: u8 = 0x17;

#[derive(Debug, Error)]
pub enum SecureError {
    #[error("handshake failed after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: String },
    #[error("handshake deadline exceeded")]
    DeadlineExceeded,
    #[error("handshake failed: {0}")]
    Failed(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Which side of the DTLS handshake this peer takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    Client,
    Server,
}

/// Pick the role from the public endpoints the coordinator handed out: the
/// lexicographically smaller (address bytes, then port) endpoint is the
/// client. Both peers compute this from identical data.
pub fn role_for(local_public: SocketAddr, remote_public: SocketAddr) -> DtlsRole {
    if endpoint_key(local_public) < endpoint_key(remote_public) {
        DtlsRole::Client
    } else {
        DtlsRole::Server
    }
}

fn endpoint_key(addr: SocketAddr) -> (Vec<u8>, u16) {
    let bytes = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    (bytes, addr.port())
}

/// Datagram source a [`HandshakeDriver`] runs the handshake over.
pub struct HandshakeSource {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    deadline: Option<Instant>,
    handshaking: bool,
}

impl HandshakeSource {
    fn new(socket: Arc<UdpSocket>, remote: SocketAddr, deadline: Duration) -> HandshakeSource {
        HandshakeSource {
            socket,
            remote,
            deadline: Some(Instant::now() + deadline),
            handshaking: true,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Largest datagram either direction accepts.
    pub fn limit(&self) -> usize {
        MAX_DATAGRAM
    }

    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.remote).map(|_| ())
    }

    /// Receive one handshake datagram. Fails hard once the handshake
    /// deadline passes, regardless of how patiently the DTLS library would
    /// keep retrying.
    pub fn receive(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let wait_until = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if let Some(deadline) = self.deadline {
                if now > deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "handshake deadline exceeded",
                    ));
                }
            }
            if now >= wait_until {
                return Ok(None);
            }

            let mut remaining = wait_until - now;
            if let Some(deadline) = self.deadline {
                remaining = remaining.min(deadline - now);
            }
            self.socket
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;

            let (len, from) = match self.socket.recv_from(buf) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            };

            if from != self.remote {
                debug!("ignoring datagram from {} (expected {})", from, self.remote);
                continue;
            }
            if self.handshaking && len > 0 {
                let first = buf[0];
                if !(DTLS_CONTENT_MIN..=DTLS_CONTENT_MAX).contains(&first) {
                    debug!(
                        "filtering non-DTLS datagram during handshake (first byte {:#04x}, {} bytes)",
                        first, len
                    );
                    continue;
                }
            }
            return Ok(Some(len));
        }
    }

    /// Lift the deadline and the content-type filter once the handshake is
    /// done; only the source-address filter remains.
    pub fn finish_handshake(&mut self) {
        self.deadline = None;
        self.handshaking = false;
    }

    /// Convert into the plain post-handshake transport (used by drivers that
    /// wrap no record layer of their own).
    pub fn into_transport(self) -> UdpTransport {
        UdpTransport {
            socket: self.socket,
            remote: self.remote,
        }
    }
}

/// A DTLS 1.2 PSK implementation. Runs one handshake attempt over `source`
/// and returns the encrypted transport on success.
pub trait HandshakeDriver {
    fn handshake(
        &mut self,
        source: HandshakeSource,
        role: DtlsRole,
        identity: &[u8],
        psk: &[u8],
    ) -> Result<Box<dyn DatagramTransport>, SecureError>;
}

/// Pass-through driver: no record layer, immediate success. This is the
/// injection point where a DTLS-PSK binding slots in; loopback tests and
/// local transfers run over it.
pub struct PlainDriver;

impl HandshakeDriver for PlainDriver {
    fn handshake(
        &mut self,
        mut source: HandshakeSource,
        role: DtlsRole,
        _identity: &[u8],
        _psk: &[u8],
    ) -> Result<Box<dyn DatagramTransport>, SecureError> {
        debug!("plain driver: skipping record-layer handshake (role {:?})", role);
        source.finish_handshake();
        Ok(Box::new(source.into_transport()))
    }
}

/// Post-handshake datagram source: passes only datagrams from the confirmed
/// endpoint.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> UdpTransport {
        UdpTransport { socket, remote }
    }
}

impl DatagramTransport for UdpTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.remote).map(|_| ())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let wait_until = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= wait_until {
                return Ok(None);
            }
            self.socket
                .set_read_timeout(Some((wait_until - now).max(Duration::from_millis(1))))?;

            match self.socket.recv_from(buf) {
                Ok((len, from)) if from == self.remote => return Ok(Some(len)),
                Ok((_, from)) => {
                    debug!("dropping datagram from {} (expected {})", from, self.remote);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn send_limit(&self) -> usize {
        MAX_DATAGRAM
    }
}

/// Establish the secure transport over a punched socket: prime the NAT, run
/// up to three handshake attempts with backoff, and hand back the transport.
pub fn establish_secure(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    local_public: SocketAddr,
    remote_public: SocketAddr,
    session_id: &str,
    psk: &str,
    driver: &mut dyn HandshakeDriver,
) -> Result<Box<dyn DatagramTransport>, SecureError> {
    let role = role_for(local_public, remote_public);
    info!(
        "secure transport role: {:?} (local_public={}, remote_public={})",
        role, local_public, remote_public
    );

    let mut last_error = String::new();
    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        prime_nat(&socket, remote);

        let source = HandshakeSource::new(socket.clone(), remote, HANDSHAKE_DEADLINE);
        match driver.handshake(source, role, session_id.as_bytes(), psk.as_bytes()) {
            Ok(transport) => {
                info!("secure transport established (attempt {})", attempt);
                return Ok(transport);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < HANDSHAKE_ATTEMPTS {
                    let backoff = ATTEMPT_BACKOFF_STEP * attempt;
                    warn!(
                        "handshake attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, HANDSHAKE_ATTEMPTS, last_error, backoff
                    );
                    std::thread::sleep(backoff);
                }
            }
        }
    }

    Err(SecureError::AttemptsExhausted {
        attempts: HANDSHAKE_ATTEMPTS,
        last: last_error,
    })
}

/// Keep the NAT mapping alive across the punch → handshake transition.
fn prime_nat(socket: &UdpSocket, remote: SocketAddr) {
    for _ in 0..PRIMING_BYTES {
        if let Err(e) = socket.send_to(&[0x00], remote) {
            debug!("error sending NAT priming byte: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Arc<UdpSocket>, Arc<UdpSocket>, SocketAddr, SocketAddr) {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let b = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        (a, b, a_addr, b_addr)
    }

    #[test]
    fn role_is_deterministic_and_opposite() {
        let a: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:8000".parse().unwrap();
        assert_eq!(role_for(a, b), DtlsRole::Client);
        assert_eq!(role_for(b, a), DtlsRole::Server);

        // Same address: the port breaks the tie.
        let c: SocketAddr = "10.0.0.1:9001".parse().unwrap();
        assert_eq!(role_for(a, c), DtlsRole::Client);
        assert_eq!(role_for(c, a), DtlsRole::Server);
    }

    #[test]
    fn handshake_source_filters_non_dtls_bytes() {
        let (a, b, a_addr, b_addr) = pair();
        let source = HandshakeSource::new(a, b_addr, Duration::from_secs(5));

        b.send_to(&[0x00], a_addr).unwrap(); // priming byte
        b.send_to(&[0xA1, 0x7F, 0x01], a_addr).unwrap(); // stale punch fragment
        b.send_to(&[0x16, 0xFE, 0xFD, 0x01], a_addr).unwrap(); // DTLS handshake record

        let mut buf = [0u8; 64];
        let n = source
            .receive(&mut buf, Duration::from_secs(2))
            .unwrap()
            .expect("DTLS record should pass the filter");
        assert_eq!(&buf[..n], &[0x16, 0xFE, 0xFD, 0x01]);
    }

    #[test]
    fn handshake_source_filters_other_sources() {
        let (a, b, a_addr, b_addr) = pair();
        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        let source = HandshakeSource::new(a, b_addr, Duration::from_secs(5));

        stranger.send_to(&[0x16, 0x01], a_addr).unwrap();
        b.send_to(&[0x17, 0x02], a_addr).unwrap();

        let mut buf = [0u8; 64];
        let n = source
            .receive(&mut buf, Duration::from_secs(2))
            .unwrap()
            .expect("datagram from the confirmed peer should pass");
        assert_eq!(&buf[..n], &[0x17, 0x02]);
    }

    #[test]
    fn handshake_deadline_is_hard() {
        let (a, _b, _a_addr, b_addr) = pair();
        let source = HandshakeSource::new(a, b_addr, Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(80));
        let mut buf = [0u8; 64];
        let err = source
            .receive(&mut buf, Duration::from_secs(10))
            .expect_err("deadline must abort the receive");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn post_handshake_filter_passes_framed_packets() {
        let (a, b, a_addr, b_addr) = pair();
        let mut transport = UdpTransport::new(a, b_addr);
        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();

        stranger.send_to(b"stray", a_addr).unwrap();
        b.send_to(b"legit", a_addr).unwrap();

        let mut buf = [0u8; 64];
        let n = transport
            .receive(&mut buf, Duration::from_secs(2))
            .unwrap()
            .expect("peer datagram should arrive");
        assert_eq!(&buf[..n], b"legit");
    }

    #[test]
    fn plain_driver_establishes_both_sides() {
        let (a, b, a_addr, b_addr) = pair();
        let pub_a: SocketAddr = "198.51.100.1:1000".parse().unwrap();
        let pub_b: SocketAddr = "198.51.100.2:1000".parse().unwrap();

        let t_b = std::thread::spawn(move || {
            establish_secure(b, a_addr, pub_b, pub_a, "sess", "psk", &mut PlainDriver)
        });
        let mut t_a =
            establish_secure(a, b_addr, pub_a, pub_b, "sess", "psk", &mut PlainDriver).unwrap();
        let mut t_b = t_b.join().unwrap().unwrap();

        t_a.send(b"hello").unwrap();
        let mut buf = [0u8; 64];
        // Priming bytes may sit ahead of the payload; skip them.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "payload never arrived");
            if let Some(n) = t_b.receive(&mut buf, Duration::from_millis(200)).unwrap() {
                if &buf[..n] == b"hello" {
                    break;
                }
            }
        }
    }
}
