//! Receiver-side reorder buffer and SACK generation.
//!
//! Accepts packets by sequence, buffers out-of-order arrivals, delivers
//! contiguous runs, and produces SACK information. The advertised window is
//! adaptive: it grows toward `MAX_WINDOW` while deliveries are clean and
//! halves when the out-of-order buffer fills past `SHRINK_PRESSURE`, so the
//! sender ramps up on clean links without over-buffering on lossy ones.
//!
//! Callers synchronize externally (the channel lock).

use std::collections::HashMap;
use std::time::Instant;

use punchdrop_proto::sack::{SackInfo, SackRange};
use punchdrop_proto::seq::{seq_after, seq_before};

const INITIAL_WINDOW: usize = 256;
const MAX_WINDOW: usize = 512;
const MIN_WINDOW: usize = 32;
const DELAYED_ACK_THRESHOLD: u32 = 2;
const ACK_TIMER_MS: u128 = 10;

/// Consecutive in-order deliveries before the window grows.
const GROW_THRESHOLD: usize = 128;
/// Growth per threshold crossing.
const GROW_INCREMENT: usize = 32;
/// Shrink when the gap buffer exceeds this fraction of the window.
const SHRINK_PRESSURE: f64 = 0.5;

pub struct ReceiveBuffer {
    expected_seq: u32,
    out_of_order: HashMap<u32, Vec<u8>>,

    acks_since_last: u32,
    last_ack_time: Instant,
    gap_detected: bool,

    max_window: usize,
    consecutive_in_order: usize,
}

impl ReceiveBuffer {
    pub fn new(initial_expected_seq: u32) -> ReceiveBuffer {
        ReceiveBuffer {
            expected_seq: initial_expected_seq,
            out_of_order: HashMap::new(),
            acks_since_last: 0,
            last_ack_time: Instant::now(),
            gap_detected: false,
            max_window: INITIAL_WINDOW,
            consecutive_in_order: 0,
        }
    }

    /// Accept an incoming packet. Returns the contiguous packets now
    /// deliverable, in order — empty when the packet was buffered or was a
    /// duplicate.
    pub fn deliver(&mut self, seq: u32, payload: Vec<u8>) -> Vec<(u32, Vec<u8>)> {
        if seq_before(seq, self.expected_seq) {
            // Duplicate or old packet.
            return Vec::new();
        }

        if seq == self.expected_seq {
            let mut result = vec![(seq, payload)];
            self.expected_seq = self.expected_seq.wrapping_add(1);
            while let Some(buffered) = self.out_of_order.remove(&self.expected_seq) {
                result.push((self.expected_seq, buffered));
                self.expected_seq = self.expected_seq.wrapping_add(1);
            }

            self.acks_since_last += result.len() as u32;

            if self.out_of_order.is_empty() {
                self.consecutive_in_order += result.len();
                if self.consecutive_in_order >= GROW_THRESHOLD && self.max_window < MAX_WINDOW {
                    self.max_window = (self.max_window + GROW_INCREMENT).min(MAX_WINDOW);
                    self.consecutive_in_order = 0;
                }
            } else {
                self.consecutive_in_order = 0;
            }

            result
        } else {
            // Out of order: buffer it.
            if !self.out_of_order.contains_key(&seq) {
                self.out_of_order.insert(seq, payload);
                self.gap_detected = true;
            }
            self.acks_since_last += 1;
            self.consecutive_in_order = 0;

            if self.out_of_order.len() as f64 > self.max_window as f64 * SHRINK_PRESSURE
                && self.max_window > MIN_WINDOW
            {
                self.max_window = (self.max_window / 2).max(MIN_WINDOW);
            }

            Vec::new()
        }
    }

    /// Generate SACK information for the current state.
    pub fn generate_sack(&self) -> SackInfo {
        let cumulative_ack = self.expected_seq.wrapping_sub(1);

        let mut ranges = Vec::new();
        if !self.out_of_order.is_empty() {
            let mut seqs: Vec<u32> = self.out_of_order.keys().copied().collect();
            seqs.sort_by(|a, b| {
                if a == b {
                    std::cmp::Ordering::Equal
                } else if seq_after(*a, *b) {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Less
                }
            });

            let mut start = seqs[0];
            let mut prev = start;
            for &seq in &seqs[1..] {
                if seq == prev.wrapping_add(1) {
                    prev = seq;
                } else {
                    ranges.push(SackRange { start, end: prev });
                    start = seq;
                    prev = seq;
                }
            }
            ranges.push(SackRange { start, end: prev });
        }

        SackInfo {
            cumulative_ack,
            receiver_window: self.advertised_window() as u32,
            ranges,
        }
    }

    /// Should an ack go out now?
    pub fn should_send_ack(&self, now: Instant) -> bool {
        if self.acks_since_last == 0 {
            return false;
        }
        self.gap_detected
            || self.acks_since_last >= DELAYED_ACK_THRESHOLD
            || now.duration_since(self.last_ack_time).as_millis() >= ACK_TIMER_MS
    }

    /// Reset ack tracking after a SACK went out.
    pub fn ack_sent(&mut self, now: Instant) {
        self.acks_since_last = 0;
        self.last_ack_time = now;
        self.gap_detected = false;
    }

    /// Available receiver window, in packets.
    pub fn advertised_window(&self) -> usize {
        self.max_window - self.out_of_order.len()
    }

    pub fn max_window(&self) -> usize {
        self.max_window
    }

    /// Next expected sequence (= cumulative ack + 1).
    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn buffered_count(&self) -> usize {
        self.out_of_order.len()
    }
}
