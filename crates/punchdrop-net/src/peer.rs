//! Top-level connection orchestrator: coordinate → hole punch → secure
//! handshake → packet router.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{error, info};

use punchdrop_transport::router::PacketRouter;

use crate::coord_client::{CoordClient, CoordError};
use crate::hole_punch::HolePuncher;
use crate::secure::{establish_secure, HandshakeDriver, SecureError};

/// Connection lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Init,
    Registering,
    WaitingPeer,
    Punching,
    Handshake,
    Connected,
    Error,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Coord(#[from] CoordError),
    #[error("hole punch failed after {0:?}")]
    HolePunchTimeout(Duration),
    #[error(transparent)]
    Secure(#[from] SecureError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

type StateListener = Box<dyn Fn(PeerState) + Send + Sync>;

pub struct PeerConnection {
    server_addr: SocketAddr,
    session_id: String,
    psk: String,

    state: Arc<Mutex<PeerState>>,
    state_listener: Arc<Mutex<Option<StateListener>>>,

    socket: Option<Arc<UdpSocket>>,
    my_public_endpoint: Option<SocketAddr>,
    remote_endpoint: Option<SocketAddr>,
    router: Option<PacketRouter>,
    send_limit: usize,
}

impl PeerConnection {
    pub fn new(server_addr: SocketAddr, session_id: &str, psk: &str) -> PeerConnection {
        PeerConnection {
            server_addr,
            session_id: session_id.to_string(),
            psk: psk.to_string(),
            state: Arc::new(Mutex::new(PeerState::Init)),
            state_listener: Arc::new(Mutex::new(None)),
            socket: None,
            my_public_endpoint: None,
            remote_endpoint: None,
            router: None,
            send_limit: 0,
        }
    }

    /// Listener invoked on every state transition (any thread).
    pub fn set_state_listener<F>(&mut self, listener: F)
    where
        F: Fn(PeerState) + Send + Sync + 'static,
    {
        *self.state_listener.lock() = Some(Box::new(listener));
    }

    /// Run the full connection flow. Blocks until the encrypted link is up
    /// and the router is pumping, or fails.
    pub fn connect(&mut self, driver: &mut dyn HandshakeDriver) -> Result<(), PeerError> {
        match self.connect_inner(driver) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(PeerState::Error);
                error!("connection failed: {}", e);
                Err(e)
            }
        }
    }

    fn connect_inner(&mut self, driver: &mut dyn HandshakeDriver) -> Result<(), PeerError> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0")?);
        info!("local socket bound to port {}", socket.local_addr()?.port());
        self.socket = Some(socket.clone());

        // Coordination.
        self.set_state(PeerState::Registering);
        let mut coord = CoordClient::new(&socket, self.server_addr, &self.session_id, &self.psk);
        {
            let state = self.state.clone();
            let listener = self.state_listener.clone();
            coord.set_on_waiting_for_peer(move || {
                *state.lock() = PeerState::WaitingPeer;
                if let Some(listener) = listener.lock().as_ref() {
                    listener(PeerState::WaitingPeer);
                }
            });
        }
        let coord_remote = coord.coordinate()?;
        let mut remote = coord_remote;
        let my_public = coord.my_public_endpoint();
        self.my_public_endpoint = my_public;
        info!("coordination complete; remote peer {}", remote);

        // Hole punch.
        self.set_state(PeerState::Punching);
        let connection_id = OsRng.next_u32();
        let mut puncher = HolePuncher::new(&socket, remote, connection_id);
        let result = puncher.punch();
        if !result.success {
            return Err(PeerError::HolePunchTimeout(result.elapsed));
        }
        if let Some(confirmed) = result.confirmed_endpoint {
            remote = confirmed;
        }
        self.remote_endpoint = Some(remote);
        info!("hole punch succeeded in {:?}", result.elapsed);

        // Secure handshake. Role comes from the coordinator-provided public
        // endpoints (both sides see the same pair), not the punch-confirmed
        // one. OK can be outrun by PEER_INFO; fall back to the local address.
        self.set_state(PeerState::Handshake);
        let local_public = match my_public {
            Some(endpoint) => endpoint,
            None => socket.local_addr()?,
        };
        let transport = establish_secure(
            socket,
            remote,
            local_public,
            coord_remote,
            &self.session_id,
            &self.psk,
            driver,
        )?;
        self.send_limit = transport.send_limit();

        // Router takes the transport and starts pumping.
        let router = PacketRouter::new();
        router.start(transport);
        self.router = Some(router);
        self.set_state(PeerState::Connected);
        info!("encrypted peer link established");

        Ok(())
    }

    /// Stop the router and release the socket.
    pub fn close(&mut self) {
        if let Some(router) = &self.router {
            router.stop();
        }
        self.router = None;
        self.socket = None;
        self.set_state(PeerState::Init);
    }

    /// Block until the connection drops or is closed.
    pub fn await_disconnect(&self) {
        if let Some(router) = &self.router {
            router.await_stop();
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// The bound UDP socket, once connect has started.
    pub fn socket(&self) -> Option<&Arc<UdpSocket>> {
        self.socket.as_ref()
    }

    pub fn router(&self) -> Option<&PacketRouter> {
        self.router.as_ref()
    }

    /// Largest datagram the secure transport accepts; 0 before connect.
    pub fn send_limit(&self) -> usize {
        self.send_limit
    }

    pub fn my_public_endpoint(&self) -> Option<SocketAddr> {
        self.my_public_endpoint
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote_endpoint
    }

    fn set_state(&self, state: PeerState) {
        *self.state.lock() = state;
        if let Some(listener) = self.state_listener.lock().as_ref() {
            listener(state);
        }
    }
}
