//! UDP coordination server: registration, HMAC-SHA256 authentication, and
//! endpoint exchange.
//!
//! Protocol flow per peer:
//! 1. peer → COORD_REGISTER(session_id)
//! 2. server → COORD_CHALLENGE(32-byte nonce)
//! 3. peer → COORD_AUTH(HMAC-SHA256(psk, nonce || session_id))
//! 4. server → COORD_OK(peer's observed endpoint)
//! 5. both peers authenticated → server → COORD_PEER_INFO to each, carrying
//!    the other's endpoint
//!
//! Malformed datagrams are logged and dropped without a response. Sessions
//! idle past the configured threshold are swept on each receive timeout.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use punchdrop_proto::endpoint::encode_endpoint;
use punchdrop_proto::packet::{Packet, PacketType, MAX_DATAGRAM};

use crate::auth::verify_hmac;
use crate::session::Session;

const SWEEP_RECV_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_BUFFER_SIZE: usize = 1 << 20;

pub const ERR_SESSION: u16 = 0x0001;
pub const ERR_AUTH: u16 = 0x0002;

pub struct CoordServer {
    socket: UdpSocket,
    psk: String,
    session_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl CoordServer {
    /// Bind the server socket. Pass port 0 to pick an ephemeral port.
    pub fn bind(addr: SocketAddr, psk: &str, session_timeout: Duration) -> io::Result<CoordServer> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(SWEEP_RECV_TIMEOUT))?;
        Ok(CoordServer {
            socket,
            psk: psk.to_string(),
            session_timeout,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for stopping the server from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run the receive loop. Blocks until [`CoordServer::stop`] is called.
    pub fn run(&self) -> io::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "coordination server listening on {}",
            self.socket.local_addr()?
        );

        let mut sessions: HashMap<String, Session> = HashMap::new();
        let mut buf = [0u8; MAX_DATAGRAM];

        while self.running.load(Ordering::SeqCst) {
            let (len, sender) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    self.sweep_expired(&mut sessions);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("bad packet from {}: {}", sender, e);
                    continue;
                }
            };

            match packet.packet_type {
                PacketType::CoordRegister => self.handle_register(&mut sessions, &packet, sender),
                PacketType::CoordAuth => self.handle_auth(&mut sessions, &packet, sender),
                PacketType::CoordKeepalive => handle_keepalive(&mut sessions, sender),
                PacketType::CoordPing => {
                    self.send_packet(sender, &Packet::control(PacketType::CoordPong))
                }
                other => debug!("unexpected type {:?} from {}", other, sender),
            }
        }

        info!("coordination server stopped");
        Ok(())
    }

    fn handle_register(
        &self,
        sessions: &mut HashMap<String, Session>,
        packet: &Packet,
        sender: SocketAddr,
    ) {
        let session_id = match decode_session_id(&packet.payload) {
            Some(id) => id,
            None => {
                self.send_error(sender, ERR_SESSION, "Invalid session ID");
                return;
            }
        };

        info!("REGISTER from {} for session '{}'", sender, session_id);

        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(&session_id));

        // Re-registration from the same endpoint: repeat the same challenge.
        if let Some(existing) = session.find_peer(sender) {
            let nonce = existing.nonce;
            self.send_packet(sender, &Packet::new(PacketType::CoordChallenge, nonce.to_vec()));
            return;
        }

        if session.is_full() {
            self.send_error(sender, ERR_SESSION, "Session full");
            return;
        }

        match session.add_peer(sender) {
            Some(slot) => {
                let nonce = slot.nonce;
                self.send_packet(sender, &Packet::new(PacketType::CoordChallenge, nonce.to_vec()));
            }
            None => self.send_error(sender, ERR_SESSION, "Session full"),
        }
    }

    fn handle_auth(
        &self,
        sessions: &mut HashMap<String, Session>,
        packet: &Packet,
        sender: SocketAddr,
    ) {
        let (session_id, received_hmac) = match decode_auth(&packet.payload) {
            Some(parts) => parts,
            None => {
                self.send_error(sender, ERR_AUTH, "Malformed auth");
                return;
            }
        };

        let session = match sessions.get_mut(&session_id) {
            Some(session) => session,
            None => {
                self.send_error(sender, ERR_SESSION, "Session not found");
                return;
            }
        };

        let nonce = match session.find_peer(sender) {
            Some(slot) => slot.nonce,
            None => {
                self.send_error(sender, ERR_AUTH, "Not registered");
                return;
            }
        };

        if !verify_hmac(&self.psk, &nonce, &session_id, &received_hmac) {
            warn!("AUTH failed from {} for session '{}'", sender, session_id);
            self.send_error(sender, ERR_AUTH, "Authentication failed");
            return;
        }

        if let Some(slot) = session.find_peer_mut(sender) {
            slot.authenticated = true;
        }
        session.touch();
        info!("AUTH success from {} for session '{}'", sender, session_id);

        // OK carries the sender's own observed endpoint.
        self.send_packet(
            sender,
            &Packet::new(PacketType::CoordOk, encode_endpoint(sender)),
        );

        if session.both_authenticated() {
            let peers = session.peers();
            let (a, b) = (peers[0].endpoint, peers[1].endpoint);
            self.send_packet(a, &Packet::new(PacketType::CoordPeerInfo, encode_endpoint(b)));
            self.send_packet(b, &Packet::new(PacketType::CoordPeerInfo, encode_endpoint(a)));
            info!(
                "session '{}': both peers authenticated, sent PEER_INFO",
                session_id
            );
        }
    }

    fn sweep_expired(&self, sessions: &mut HashMap<String, Session>) {
        let now = Instant::now();
        let timeout = self.session_timeout;
        sessions.retain(|id, session| {
            let expired = now.duration_since(session.last_activity()) > timeout;
            if expired {
                debug!("session '{}' expired", id);
            }
            !expired
        });
    }

    fn send_error(&self, dest: SocketAddr, code: u16, message: &str) {
        let mut payload = Vec::with_capacity(2 + message.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(message.as_bytes());
        self.send_packet(dest, &Packet::new(PacketType::CoordError, payload));
    }

    fn send_packet(&self, dest: SocketAddr, packet: &Packet) {
        if let Err(e) = self.socket.send_to(&packet.encode(), dest) {
            warn!("failed to send to {}: {}", dest, e);
        }
    }
}

fn handle_keepalive(sessions: &mut HashMap<String, Session>, sender: SocketAddr) {
    for session in sessions.values_mut() {
        let authed = session
            .find_peer(sender)
            .map(|slot| slot.authenticated)
            .unwrap_or(false);
        if authed {
            session.touch();
            break;
        }
    }
}

/// REGISTER payload: 2-byte length + UTF-8 session id.
fn decode_session_id(payload: &[u8]) -> Option<String> {
    if payload.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if len == 0 || payload.len() < 2 + len {
        return None;
    }
    std::str::from_utf8(&payload[2..2 + len])
        .ok()
        .map(str::to_string)
}

/// AUTH payload: length-prefixed session id + 32-byte HMAC.
fn decode_auth(payload: &[u8]) -> Option<(String, [u8; 32])> {
    if payload.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if len == 0 || payload.len() < 2 + len + 32 {
        return None;
    }
    let session_id = std::str::from_utf8(&payload[2..2 + len]).ok()?.to_string();
    let hmac: [u8; 32] = payload[2 + len..2 + len + 32].try_into().ok()?;
    Some((session_id, hmac))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_payload_parsing() {
        let mut payload = vec![0x00, 0x05];
        payload.extend_from_slice(b"alpha");
        assert_eq!(decode_session_id(&payload).unwrap(), "alpha");
        assert!(decode_session_id(&[0x00]).is_none());
        assert!(decode_session_id(&[0x00, 0x00]).is_none());
        assert!(decode_session_id(&[0x00, 0x09, b'x']).is_none());
    }

    #[test]
    fn auth_payload_parsing() {
        let mut payload = vec![0x00, 0x03];
        payload.extend_from_slice(b"abc");
        payload.extend_from_slice(&[0x11; 32]);
        let (id, mac) = decode_auth(&payload).unwrap();
        assert_eq!(id, "abc");
        assert_eq!(mac, [0x11; 32]);
        assert!(decode_auth(&payload[..payload.len() - 1]).is_none());
    }
}
