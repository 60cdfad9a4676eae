//! Selective acknowledgment payload.
//!
//! ```text
//! [0..4]  Cumulative ack (u32): everything up to this seq is received
//! [4..8]  Receiver window (u32): available buffer space in packets
//! [8..]   Ranges, 8 bytes each: inclusive [start, end] pairs
//! ```

use crate::packet::PacketError;

const FIXED_SIZE: usize = 8;
const RANGE_SIZE: usize = 8;

/// An inclusive range of selectively acknowledged sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackRange {
    pub start: u32,
    pub end: u32,
}

/// Selective acknowledgment sent by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackInfo {
    pub cumulative_ack: u32,
    pub receiver_window: u32,
    pub ranges: Vec<SackRange>,
}

impl SackInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_SIZE + self.ranges.len() * RANGE_SIZE);
        out.extend_from_slice(&self.cumulative_ack.to_be_bytes());
        out.extend_from_slice(&self.receiver_window.to_be_bytes());
        for r in &self.ranges {
            out.extend_from_slice(&r.start.to_be_bytes());
            out.extend_from_slice(&r.end.to_be_bytes());
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<SackInfo, PacketError> {
        if payload.len() < FIXED_SIZE {
            return Err(PacketError::TruncatedPayload("SACK"));
        }
        let cumulative_ack = u32::from_be_bytes(payload[0..4].try_into().unwrap());
        let receiver_window = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        let mut ranges = Vec::new();
        let mut off = FIXED_SIZE;
        while payload.len() - off >= RANGE_SIZE {
            ranges.push(SackRange {
                start: u32::from_be_bytes(payload[off..off + 4].try_into().unwrap()),
                end: u32::from_be_bytes(payload[off + 4..off + 8].try_into().unwrap()),
            });
            off += RANGE_SIZE;
        }
        Ok(SackInfo {
            cumulative_ack,
            receiver_window,
            ranges,
        })
    }
}
