//! Wire protocol for punchdrop: framed datagram codec and payload formats.
//!
//! Every datagram on the wire — coordination, hole punch, and the reliable
//! data plane — uses the same 20-byte framed header defined in [`packet`].
//! The remaining modules encode the payloads that ride inside it: endpoints,
//! selective acknowledgments, and file-transfer metadata.

pub mod endpoint;
pub mod metadata;
pub mod packet;
pub mod sack;
pub mod seq;

pub use endpoint::{decode_endpoint, encode_endpoint};
pub use metadata::{file_sha256, FileMetadata};
pub use packet::{
    looks_like_packet, Packet, PacketError, PacketType, HEADER_SIZE, MAGIC, MAX_DATAGRAM,
    MAX_PAYLOAD, VERSION,
};
pub use sack::{SackInfo, SackRange};
