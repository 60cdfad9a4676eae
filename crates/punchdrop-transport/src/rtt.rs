//! RTT estimation and RTO calculation.
//!
//! ```text
//! On each non-retransmitted packet's ack:
//!   srtt   = (1 - ALPHA) * srtt + ALPHA * sample
//!   rttvar = (1 - BETA) * rttvar + BETA * |sample - srtt|
//!   rto    = clamp(round(srtt + 4 * rttvar), MIN_RTO, MAX_RTO)
//!
//! On retransmission timeout:
//!   rto = min(rto * 2, MAX_RTO)
//! ```
//!
//! Karn's rule: callers must not feed samples taken from retransmitted
//! packets.

use std::time::Duration;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;
const MIN_RTO_MS: u64 = 200;
const MAX_RTO_MS: u64 = 10_000;
const INITIAL_RTO_MS: u64 = 1_000;

pub struct RttEstimator {
    srtt: f64,
    rttvar: f64,
    rto_ms: u64,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator {
            srtt: 0.0,
            rttvar: 0.0,
            rto_ms: INITIAL_RTO_MS,
            has_sample: false,
        }
    }

    /// Record a new sample, in milliseconds, from a non-retransmitted packet.
    pub fn add_sample(&mut self, sample_ms: u64) {
        let sample = sample_ms as f64;
        if !self.has_sample {
            self.srtt = sample;
            self.rttvar = sample / 2.0;
            self.has_sample = true;
        } else {
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (sample - self.srtt).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * sample;
        }
        let rto = (self.srtt + 4.0 * self.rttvar).round() as u64;
        self.rto_ms = rto.clamp(MIN_RTO_MS, MAX_RTO_MS);
    }

    /// Exponential backoff on retransmission timeout.
    pub fn backoff(&mut self) {
        self.rto_ms = (self.rto_ms * 2).min(MAX_RTO_MS);
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }

    /// Smoothed RTT in milliseconds, 0 before the first sample.
    pub fn srtt(&self) -> f64 {
        self.srtt
    }

    pub fn has_samples(&self) -> bool {
        self.has_sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initializes() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.rto(), Duration::from_millis(1000));
        rtt.add_sample(100);
        assert_eq!(rtt.srtt(), 100.0);
        // rttvar = 50, rto = 100 + 200 = 300
        assert_eq!(rtt.rto(), Duration::from_millis(300));
    }

    #[test]
    fn second_sample_smooths() {
        let mut rtt = RttEstimator::new();
        rtt.add_sample(100);
        rtt.add_sample(200);
        // rttvar = 0.75*50 + 0.25*100 = 62.5; srtt = 0.875*100 + 0.125*200 = 112.5
        assert_eq!(rtt.srtt(), 112.5);
        // rto = round(112.5 + 250) = 363
        assert_eq!(rtt.rto(), Duration::from_millis(363));
    }

    #[test]
    fn rto_clamped_low() {
        let mut rtt = RttEstimator::new();
        for _ in 0..20 {
            rtt.add_sample(1);
        }
        assert_eq!(rtt.rto(), Duration::from_millis(200));
    }

    #[test]
    fn rto_clamped_high() {
        let mut rtt = RttEstimator::new();
        rtt.add_sample(60_000);
        assert_eq!(rtt.rto(), Duration::from_millis(10_000));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut rtt = RttEstimator::new();
        rtt.backoff();
        assert_eq!(rtt.rto(), Duration::from_millis(2000));
        for _ in 0..10 {
            rtt.backoff();
        }
        assert_eq!(rtt.rto(), Duration::from_millis(10_000));
    }
}
