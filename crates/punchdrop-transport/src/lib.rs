//! Reliable transport over an encrypted datagram channel.
//!
//! The pieces, bottom up:
//! - [`datagram`]: the secure-datagram abstraction the whole stack runs on
//!   (a DTLS 1.2 PSK transport in production, an in-memory pair in tests)
//! - [`rtt`]: Karn-safe RTT estimation and RTO
//! - [`congestion`]: AIMD with slow start and fast retransmit
//! - [`send_window`]: per-packet in-flight tracking and SACK processing
//! - [`recv_buffer`]: reordering, duplicate rejection, SACK generation,
//!   adaptive advertised window
//! - [`router`]: the single-threaded I/O pump that owns the transport
//! - [`channel`]: the reliable channel tying it all together

pub mod channel;
pub mod congestion;
pub mod datagram;
pub mod recv_buffer;
pub mod router;
pub mod rtt;
pub mod send_window;

pub use channel::{ChannelError, DataPayload, ReliableChannel, DEFAULT_MAX_CHUNK_DATA};
pub use congestion::CongestionControl;
pub use datagram::{memory_pair, DatagramTransport, MemoryTransport};
pub use recv_buffer::ReceiveBuffer;
pub use router::{PacketRouter, RouterStopped};
pub use rtt::RttEstimator;
pub use send_window::SendWindow;
