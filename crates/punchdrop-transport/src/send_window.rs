//! Sender-side sliding window with per-packet tracking.
//!
//! Tracks in-flight packets, processes SACKs, detects gaps for
//! retransmission, and assigns sequence numbers. Sequences are consecutive,
//! so the window is a deque indexed by `seq - front_seq`.
//!
//! Callers synchronize externally (the channel lock).

use std::collections::VecDeque;
use std::time::Instant;

use punchdrop_proto::sack::SackInfo;
use punchdrop_proto::seq::{seq_before, seq_in_range, seq_le};

/// Metadata for one sent packet.
pub struct SentRecord {
    pub sequence: u32,
    /// Full encoded packet, kept for retransmission.
    pub data: Vec<u8>,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub acked: bool,
    pub retransmitted: bool,
    pub retransmit_count: u32,
}

pub struct SendWindow {
    base_seq: u32,
    next_seq: u32,
    in_flight: VecDeque<SentRecord>,
    // Timing of the record most recently removed at the cumulative edge.
    // The record itself is gone by the time the caller samples RTT, so its
    // send time and retransmit flag are kept here.
    edge: Option<(u32, Instant, bool)>,
}

impl SendWindow {
    pub fn new(initial_seq: u32) -> SendWindow {
        SendWindow {
            base_seq: initial_seq,
            next_seq: initial_seq,
            in_flight: VecDeque::new(),
            edge: None,
        }
    }

    /// Assign the next sequence number and track the encoded packet.
    pub fn track(&mut self, encoded: Vec<u8>, now: Instant) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.in_flight.push_back(SentRecord {
            sequence: seq,
            data: encoded,
            first_sent: now,
            last_sent: now,
            acked: false,
            retransmitted: false,
            retransmit_count: 0,
        });
        seq
    }

    /// Process a SACK from the receiver. Returns sequences detected as lost
    /// (un-acked packets before the first SACK range).
    pub fn process_sack(&mut self, sack: &SackInfo) -> Vec<u32> {
        let cum = sack.cumulative_ack;

        // 1. Advance the base: everything <= cum is fully received.
        while let Some(front) = self.in_flight.front() {
            if seq_le(front.sequence, cum) {
                let rec = self.in_flight.pop_front().unwrap();
                if rec.sequence == cum {
                    self.edge = Some((rec.sequence, rec.first_sent, rec.retransmitted));
                }
            } else {
                break;
            }
        }
        self.base_seq = cum.wrapping_add(1);

        // 2. Mark selectively acked packets (not removed: they sit above the
        //    cumulative edge).
        for range in &sack.ranges {
            for rec in self.in_flight.iter_mut() {
                if seq_in_range(rec.sequence, range.start, range.end) {
                    rec.acked = true;
                }
            }
        }

        // 3. Gaps: un-acked packets before the first SACK range are lost.
        let mut lost = Vec::new();
        if let Some(first) = sack.ranges.first() {
            for rec in &self.in_flight {
                if !rec.acked && seq_before(rec.sequence, first.start) {
                    lost.push(rec.sequence);
                }
            }
        }
        lost
    }

    /// Sequences whose RTO has expired and need retransmission.
    pub fn retransmittable(&self, now: Instant, rto: std::time::Duration) -> Vec<u32> {
        self.in_flight
            .iter()
            .filter(|rec| !rec.acked && now.duration_since(rec.last_sent) >= rto)
            .map(|rec| rec.sequence)
            .collect()
    }

    /// Encoded bytes of a tracked packet, cloned for retransmission.
    pub fn data_for(&self, sequence: u32) -> Option<Vec<u8>> {
        self.record(sequence).map(|rec| rec.data.clone())
    }

    /// Mark a packet as retransmitted: bumps the count, updates `last_sent`.
    pub fn mark_retransmitted(&mut self, sequence: u32, now: Instant) {
        if let Some(rec) = self.record_mut(sequence) {
            rec.retransmitted = true;
            rec.retransmit_count += 1;
            rec.last_sent = now;
        }
    }

    /// Was this packet ever retransmitted (Karn's rule)?
    pub fn was_retransmitted(&self, sequence: u32) -> bool {
        if let Some(rec) = self.record(sequence) {
            return rec.retransmitted;
        }
        matches!(self.edge, Some((seq, _, retrans)) if seq == sequence && retrans)
    }

    /// First-send time of a packet, for RTT sampling. Answers for the
    /// cumulative-edge record even after it has been removed.
    pub fn send_time(&self, sequence: u32) -> Option<Instant> {
        if let Some(rec) = self.record(sequence) {
            return Some(rec.first_sent);
        }
        match self.edge {
            Some((seq, sent, _)) if seq == sequence => Some(sent),
            _ => None,
        }
    }

    /// Number of un-acked packets in flight.
    pub fn inflight_count(&self) -> usize {
        self.in_flight.iter().filter(|rec| !rec.acked).count()
    }

    /// Can another packet go out under `effective_window`?
    pub fn can_send(&self, effective_window: usize) -> bool {
        self.inflight_count() < effective_window
    }

    pub fn base_seq(&self) -> u32 {
        self.base_seq
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Total tracked records, acked or not.
    pub fn tracked_count(&self) -> usize {
        self.in_flight.len()
    }

    fn record(&self, sequence: u32) -> Option<&SentRecord> {
        let front = self.in_flight.front()?.sequence;
        let idx = sequence.wrapping_sub(front) as usize;
        self.in_flight.get(idx)
    }

    fn record_mut(&mut self, sequence: u32) -> Option<&mut SentRecord> {
        let front = self.in_flight.front()?.sequence;
        let idx = sequence.wrapping_sub(front) as usize;
        self.in_flight.get_mut(idx)
    }
}
