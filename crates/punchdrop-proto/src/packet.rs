//! Framed datagram codec.
//!
//! Wire format (big-endian, 20-byte header + payload):
//!
//! ```text
//! [0..2]   Magic 0xA1 0x7F
//! [2]      Version (1)
//! [3]      Type
//! [4]      Flags
//! [5..9]   Connection ID (u32)
//! [9..13]  Sequence (u32)
//! [13..15] Payload length (u16, max 1180)
//! [15]     Reserved (0x00)
//! [16..20] CRC-32 over bytes 0..16
//! [20..]   Payload
//! ```
//!
//! Total datagram never exceeds 1200 bytes. Decode is strict: bad magic,
//! version, length, CRC, unknown type, or trailing bytes all reject.

use thiserror::Error;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Maximum payload bytes per packet.
pub const MAX_PAYLOAD: usize = 1180;

/// Maximum datagram size (header + payload).
pub const MAX_DATAGRAM: usize = HEADER_SIZE + MAX_PAYLOAD;

/// Protocol magic bytes.
pub const MAGIC: [u8; 2] = [0xA1, 0x7F];

/// Protocol version.
pub const VERSION: u8 = 1;

/// Informational flag bits (not currently interpreted).
pub const FLAG_ENCRYPTED: u8 = 0x01;
pub const FLAG_COMPRESSED: u8 = 0x02;
pub const FLAG_RELAY: u8 = 0x04;

const CRC_INPUT_LEN: usize = 16;

/// All message types, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Punch = 0x01,
    PunchAck = 0x02,
    Keepalive = 0x03,
    KeepaliveAck = 0x04,

    FileOffer = 0x10,
    FileAccept = 0x11,
    FileReject = 0x12,
    Data = 0x20,
    Sack = 0x21,
    Complete = 0x30,
    Verified = 0x31,
    Cancel = 0x32,

    CoordRegister = 0xC0,
    CoordChallenge = 0xC1,
    CoordAuth = 0xC2,
    CoordOk = 0xC3,
    CoordPeerInfo = 0xC4,
    CoordKeepalive = 0xC5,
    CoordRelay = 0xC6,
    CoordPing = 0xC7,
    CoordPong = 0xC8,
    CoordError = 0xCF,

    Error = 0xFF,
}

impl PacketType {
    /// Wire code for this type.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(code: u8) -> Result<Self, PacketError> {
        Ok(match code {
            0x01 => PacketType::Punch,
            0x02 => PacketType::PunchAck,
            0x03 => PacketType::Keepalive,
            0x04 => PacketType::KeepaliveAck,
            0x10 => PacketType::FileOffer,
            0x11 => PacketType::FileAccept,
            0x12 => PacketType::FileReject,
            0x20 => PacketType::Data,
            0x21 => PacketType::Sack,
            0x30 => PacketType::Complete,
            0x31 => PacketType::Verified,
            0x32 => PacketType::Cancel,
            0xC0 => PacketType::CoordRegister,
            0xC1 => PacketType::CoordChallenge,
            0xC2 => PacketType::CoordAuth,
            0xC3 => PacketType::CoordOk,
            0xC4 => PacketType::CoordPeerInfo,
            0xC5 => PacketType::CoordKeepalive,
            0xC6 => PacketType::CoordRelay,
            0xC7 => PacketType::CoordPing,
            0xC8 => PacketType::CoordPong,
            0xCF => PacketType::CoordError,
            0xFF => PacketType::Error,
            other => return Err(PacketError::UnknownType(other)),
        })
    }
}

/// Why a datagram failed to decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic: {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported version: {0}")]
    BadVersion(u8),
    #[error("unknown packet type: {0:#04x}")]
    UnknownType(u8),
    #[error("payload length out of range: {0}")]
    PayloadTooLarge(usize),
    #[error("payload length {declared} does not match datagram ({actual} bytes after header)")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("header CRC mismatch: received {received:#010x}, computed {computed:#010x}")]
    CrcMismatch { received: u32, computed: u32 },
    #[error("truncated {0} payload")]
    TruncatedPayload(&'static str),
    #[error("invalid UTF-8 in {0}")]
    BadUtf8(&'static str),
}

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub flags: u8,
    pub connection_id: u32,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Packet with a payload, zero flags/connection id/sequence.
    ///
    /// # Panics
    /// Panics if `payload` exceeds [`MAX_PAYLOAD`].
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        assert!(payload.len() <= MAX_PAYLOAD);
        Packet {
            packet_type,
            flags: 0,
            connection_id: 0,
            sequence: 0,
            payload,
        }
    }

    /// Header-only packet (keepalives, punches, VERIFIED, ...).
    pub fn control(packet_type: PacketType) -> Self {
        Packet::new(packet_type, Vec::new())
    }

    /// Fully specified packet.
    ///
    /// # Panics
    /// Panics if `payload` exceeds [`MAX_PAYLOAD`].
    pub fn with_header(
        packet_type: PacketType,
        flags: u8,
        connection_id: u32,
        sequence: u32,
        payload: Vec<u8>,
    ) -> Self {
        assert!(payload.len() <= MAX_PAYLOAD);
        Packet {
            packet_type,
            flags,
            connection_id,
            sequence,
            payload,
        }
    }

    /// Encode into a datagram ready to send.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE + self.payload.len()];
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = VERSION;
        out[3] = self.packet_type.code();
        out[4] = self.flags;
        out[5..9].copy_from_slice(&self.connection_id.to_be_bytes());
        out[9..13].copy_from_slice(&self.sequence.to_be_bytes());
        out[13..15].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out[15] = 0x00;
        let crc = crc32fast::hash(&out[..CRC_INPUT_LEN]);
        out[16..20].copy_from_slice(&crc.to_be_bytes());
        out[HEADER_SIZE..].copy_from_slice(&self.payload);
        out
    }

    /// Decode a received datagram.
    pub fn decode(data: &[u8]) -> Result<Packet, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::TooShort(data.len()));
        }
        if data[0..2] != MAGIC {
            return Err(PacketError::BadMagic(u16::from_be_bytes([
                data[0], data[1],
            ])));
        }
        if data[2] != VERSION {
            return Err(PacketError::BadVersion(data[2]));
        }
        let packet_type = PacketType::try_from(data[3])?;
        let flags = data[4];
        let connection_id = u32::from_be_bytes(data[5..9].try_into().unwrap());
        let sequence = u32::from_be_bytes(data[9..13].try_into().unwrap());
        let payload_len = u16::from_be_bytes(data[13..15].try_into().unwrap()) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        // Strict framing: the declared length must match the datagram exactly,
        // no truncation and no trailing bytes.
        let actual = data.len() - HEADER_SIZE;
        if payload_len != actual {
            return Err(PacketError::LengthMismatch {
                declared: payload_len,
                actual,
            });
        }
        let received = u32::from_be_bytes(data[16..20].try_into().unwrap());
        let computed = crc32fast::hash(&data[..CRC_INPUT_LEN]);
        if received != computed {
            return Err(PacketError::CrcMismatch { received, computed });
        }
        Ok(Packet {
            packet_type,
            flags,
            connection_id,
            sequence,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Cheap magic-only check: does this datagram look like our protocol?
///
/// Used by the hole-punch loop to tell our packets apart from stray
/// datagrams without a full decode.
pub fn looks_like_packet(data: &[u8]) -> bool {
    data.len() >= 2 && data[0..2] == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(packet_type: PacketType, payload_len: usize) -> Packet {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        Packet::with_header(packet_type, FLAG_ENCRYPTED, 0xDEADBEEF, 0xFFFF_FFF0, payload)
    }

    #[test]
    fn roundtrip_all_types() {
        let types = [
            PacketType::Punch,
            PacketType::PunchAck,
            PacketType::Keepalive,
            PacketType::KeepaliveAck,
            PacketType::FileOffer,
            PacketType::FileAccept,
            PacketType::FileReject,
            PacketType::Data,
            PacketType::Sack,
            PacketType::Complete,
            PacketType::Verified,
            PacketType::Cancel,
            PacketType::CoordRegister,
            PacketType::CoordChallenge,
            PacketType::CoordAuth,
            PacketType::CoordOk,
            PacketType::CoordPeerInfo,
            PacketType::CoordKeepalive,
            PacketType::CoordRelay,
            PacketType::CoordPing,
            PacketType::CoordPong,
            PacketType::CoordError,
            PacketType::Error,
        ];
        for t in types {
            for len in [0usize, 1, 17, 512, MAX_PAYLOAD] {
                let pkt = sample(t, len);
                let decoded = Packet::decode(&pkt.encode()).unwrap();
                assert_eq!(decoded, pkt);
            }
        }
    }

    #[test]
    fn header_mutation_rejected() {
        let encoded = sample(PacketType::Data, 64).encode();
        for i in 0..16 {
            let mut bad = encoded.clone();
            bad[i] ^= 0x01;
            assert!(
                Packet::decode(&bad).is_err(),
                "mutated byte {} should fail decode",
                i
            );
        }
    }

    #[test]
    fn unknown_type_rejected_even_with_valid_crc() {
        let mut encoded = sample(PacketType::Data, 8).encode();
        encoded[3] = 0xFE;
        let crc = crc32fast::hash(&encoded[..16]);
        encoded[16..20].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(
            Packet::decode(&encoded),
            Err(PacketError::UnknownType(0xFE))
        );
    }

    #[test]
    fn short_datagram_rejected() {
        assert_eq!(Packet::decode(&[0xA1]), Err(PacketError::TooShort(1)));
        let encoded = sample(PacketType::Sack, 32).encode();
        assert!(Packet::decode(&encoded[..HEADER_SIZE + 16]).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut encoded = sample(PacketType::Data, 16).encode();
        encoded.push(0x00);
        assert_eq!(
            Packet::decode(&encoded),
            Err(PacketError::LengthMismatch {
                declared: 16,
                actual: 17
            })
        );
    }

    #[test]
    fn oversized_declared_length_rejected() {
        // Declared length above MAX_PAYLOAD is rejected before the CRC check.
        let mut encoded = vec![0u8; HEADER_SIZE + 1300];
        encoded[0..2].copy_from_slice(&MAGIC);
        encoded[2] = VERSION;
        encoded[3] = PacketType::Data.code();
        encoded[13..15].copy_from_slice(&1300u16.to_be_bytes());
        assert_eq!(
            Packet::decode(&encoded),
            Err(PacketError::PayloadTooLarge(1300))
        );
    }

    #[test]
    fn looks_like_ours() {
        assert!(looks_like_packet(&sample(PacketType::Punch, 0).encode()));
        assert!(!looks_like_packet(&[0x00]));
        assert!(!looks_like_packet(&[0x16, 0xFE, 0xFD])); // DTLS record
    }

    #[test]
    fn max_datagram_bound() {
        let encoded = sample(PacketType::Data, MAX_PAYLOAD).encode();
        assert_eq!(encoded.len(), MAX_DATAGRAM);
        assert_eq!(encoded.len(), 1200);
    }
}
