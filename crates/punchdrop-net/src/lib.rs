//! NAT traversal and connection establishment.
//!
//! The pieces, in the order a connection uses them:
//! - [`coord_server`] / [`coord_client`]: rendezvous at the coordination
//!   service: registration, HMAC-SHA256 challenge/response, endpoint exchange
//! - [`hole_punch`]: simultaneous PUNCH bursts to open NAT mappings
//! - [`secure`]: role selection and handshake envelope for the DTLS 1.2 PSK
//!   transport (the DTLS library itself plugs in behind [`secure::HandshakeDriver`])
//! - [`peer`]: the orchestrator driving coordinate → punch → handshake →
//!   packet router

pub mod auth;
pub mod coord_client;
pub mod coord_server;
pub mod hole_punch;
pub mod peer;
pub mod secure;
pub mod session;

pub use coord_client::{CoordClient, CoordError};
pub use coord_server::CoordServer;
pub use hole_punch::{HolePunchResult, HolePuncher};
pub use peer::{PeerConnection, PeerError, PeerState};
pub use secure::{
    establish_secure, role_for, DtlsRole, HandshakeDriver, HandshakeSource, PlainDriver,
    SecureError, UdpTransport,
};
