//! Coordination client: register, authenticate, learn both public endpoints.
//!
//! All methods block; the caller runs this on its own thread before the
//! packet router exists (the peer connection does exactly that).

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use punchdrop_proto::endpoint::decode_endpoint;
use punchdrop_proto::packet::{Packet, PacketType, MAX_DATAGRAM};

use crate::auth::compute_hmac;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;
const PEER_WAIT: Duration = Duration::from_secs(120);
const WAIT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("REGISTER failed after {0} attempts")]
    RegisterRetriesExhausted(u32),
    #[error("AUTH failed after {0} attempts")]
    AuthRetriesExhausted(u32),
    #[error("server rejected: {code:#06x}: {message}")]
    ServerRejected { code: u16, message: String },
    #[error("timed out waiting for peer ({0:?})")]
    WaitingForPeerTimedOut(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct CoordClient<'a> {
    socket: &'a UdpSocket,
    server_addr: SocketAddr,
    session_id: String,
    psk: String,

    on_waiting_for_peer: Option<Box<dyn Fn() + Send>>,
    my_public_endpoint: Option<SocketAddr>,
    remote_endpoint: Option<SocketAddr>,
}

impl<'a> CoordClient<'a> {
    pub fn new(
        socket: &'a UdpSocket,
        server_addr: SocketAddr,
        session_id: &str,
        psk: &str,
    ) -> CoordClient<'a> {
        CoordClient {
            socket,
            server_addr,
            session_id: session_id.to_string(),
            psk: psk.to_string(),
            on_waiting_for_peer: None,
            my_public_endpoint: None,
            remote_endpoint: None,
        }
    }

    /// Callback fired when entering the wait-for-peer phase.
    pub fn set_on_waiting_for_peer<F>(&mut self, callback: F)
    where
        F: Fn() + Send + 'static,
    {
        self.on_waiting_for_peer = Some(Box::new(callback));
    }

    /// Run the full coordination flow. Blocks until PEER_INFO arrives or the
    /// operation fails. Returns the remote peer's public endpoint.
    pub fn coordinate(&mut self) -> Result<SocketAddr, CoordError> {
        self.socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        let nonce = self.register()?;
        self.authenticate(&nonce)?;
        self.wait_for_peer_info()?;

        self.remote_endpoint
            .ok_or(CoordError::WaitingForPeerTimedOut(PEER_WAIT))
    }

    /// Own public endpoint as observed by the server (set after AUTH).
    pub fn my_public_endpoint(&self) -> Option<SocketAddr> {
        self.my_public_endpoint
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote_endpoint
    }

    fn register(&mut self) -> Result<Vec<u8>, CoordError> {
        let id_bytes = self.session_id.as_bytes();
        let mut payload = Vec::with_capacity(2 + id_bytes.len());
        payload.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
        payload.extend_from_slice(id_bytes);
        let register = Packet::new(PacketType::CoordRegister, payload);

        for attempt in 1..=MAX_RETRIES {
            self.send(&register)?;
            info!(
                "sent REGISTER for session '{}' (attempt {})",
                self.session_id, attempt
            );

            match self.receive()? {
                Some(response) => match response.packet_type {
                    PacketType::CoordChallenge => {
                        info!("received CHALLENGE ({} byte nonce)", response.payload.len());
                        return Ok(response.payload);
                    }
                    PacketType::CoordError => return Err(decode_error(&response)),
                    other => warn!("unexpected response to REGISTER: {:?}", other),
                },
                None => warn!("REGISTER timeout (attempt {})", attempt),
            }
        }
        Err(CoordError::RegisterRetriesExhausted(MAX_RETRIES))
    }

    fn authenticate(&mut self, nonce: &[u8]) -> Result<(), CoordError> {
        let hmac = compute_hmac(&self.psk, nonce, &self.session_id);
        let id_bytes = self.session_id.as_bytes();
        let mut payload = Vec::with_capacity(2 + id_bytes.len() + 32);
        payload.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
        payload.extend_from_slice(id_bytes);
        payload.extend_from_slice(&hmac);
        let auth = Packet::new(PacketType::CoordAuth, payload);

        for attempt in 1..=MAX_RETRIES {
            self.send(&auth)?;
            info!(
                "sent AUTH for session '{}' (attempt {})",
                self.session_id, attempt
            );

            match self.receive()? {
                Some(response) => match response.packet_type {
                    PacketType::CoordOk => {
                        self.my_public_endpoint = decode_endpoint(&response.payload).ok();
                        info!("authenticated; public endpoint {:?}", self.my_public_endpoint);
                        return Ok(());
                    }
                    PacketType::CoordError => return Err(decode_error(&response)),
                    PacketType::CoordPeerInfo => {
                        // Both peers authenticated nearly simultaneously: the
                        // server's PEER_INFO overtook our OK. Take it.
                        self.handle_peer_info(&response);
                        return Ok(());
                    }
                    other => warn!("unexpected response to AUTH: {:?}", other),
                },
                None => warn!("AUTH timeout (attempt {})", attempt),
            }
        }
        Err(CoordError::AuthRetriesExhausted(MAX_RETRIES))
    }

    fn wait_for_peer_info(&mut self) -> Result<(), CoordError> {
        if self.remote_endpoint.is_some() {
            // Already arrived during the auth phase.
            return Ok(());
        }

        info!("waiting for peer to join session '{}'", self.session_id);
        if let Some(callback) = &self.on_waiting_for_peer {
            callback();
        }

        let deadline = Instant::now() + PEER_WAIT;
        let mut last_keepalive = Instant::now();

        while Instant::now() < deadline {
            // Keep the session alive while the other side takes its time.
            if last_keepalive.elapsed() >= WAIT_KEEPALIVE_INTERVAL {
                self.send(&Packet::control(PacketType::CoordKeepalive))?;
                last_keepalive = Instant::now();
            }

            match self.receive()? {
                Some(response) => match response.packet_type {
                    PacketType::CoordPeerInfo => {
                        self.handle_peer_info(&response);
                        if self.remote_endpoint.is_some() {
                            return Ok(());
                        }
                    }
                    PacketType::CoordError => return Err(decode_error(&response)),
                    other => debug!("ignoring {:?} while waiting for PEER_INFO", other),
                },
                None => {} // keep waiting
            }
        }
        Err(CoordError::WaitingForPeerTimedOut(PEER_WAIT))
    }

    fn handle_peer_info(&mut self, packet: &Packet) {
        match decode_endpoint(&packet.payload) {
            Ok(endpoint) => {
                info!("received PEER_INFO: remote endpoint {}", endpoint);
                self.remote_endpoint = Some(endpoint);
            }
            Err(e) => warn!("bad PEER_INFO payload: {}", e),
        }
    }

    fn send(&self, packet: &Packet) -> Result<(), CoordError> {
        self.socket
            .send_to(&packet.encode(), self.server_addr)
            .map_err(CoordError::Io)?;
        Ok(())
    }

    /// Receive one packet from the server. `Ok(None)` on timeout; malformed
    /// datagrams are dropped and counted as a timeout for retry purposes.
    fn receive(&self) -> Result<Option<Packet>, CoordError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _from)) => match Packet::decode(&buf[..len]) {
                Ok(packet) => Ok(Some(packet)),
                Err(e) => {
                    debug!("ignoring malformed coordination packet: {}", e);
                    Ok(None)
                }
            },
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(CoordError::Io(e)),
        }
    }
}

fn decode_error(packet: &Packet) -> CoordError {
    let payload = &packet.payload;
    if payload.len() < 2 {
        return CoordError::ServerRejected {
            code: 0,
            message: "(empty error)".to_string(),
        };
    }
    CoordError::ServerRejected {
        code: u16::from_be_bytes([payload[0], payload[1]]),
        message: String::from_utf8_lossy(&payload[2..]).to_string(),
    }
}
