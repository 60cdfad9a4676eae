//! Transfer progress: byte counters, speed, ETA. All counters are atomic so
//! a display thread can read them lock-free while the transfer runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct TransferProgress {
    total_bytes: u64,
    transferred: AtomicU64,
    start: Instant,
}

impl TransferProgress {
    pub fn new(total_bytes: u64) -> TransferProgress {
        TransferProgress {
            total_bytes,
            transferred: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn update(&self, transferred: u64) {
        self.transferred.store(transferred, Ordering::Relaxed);
    }

    pub fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total_bytes
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.transferred() as f64 * 100.0 / self.total_bytes as f64
    }

    /// Bytes per second since the transfer started.
    pub fn speed_bps(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.transferred() as f64 / elapsed
    }

    /// Estimated seconds remaining; `None` before any throughput is known.
    pub fn eta_seconds(&self) -> Option<u64> {
        let bps = self.speed_bps();
        if bps <= 0.0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.transferred());
        Some((remaining as f64 / bps) as u64)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.transferred() >= self.total_bytes
    }

    /// `[=========>       ]  56%  2.3 MB/s  ETA 0:45`
    pub fn progress_bar(&self, width: usize) -> String {
        let pct = self.percent();
        let filled = (width as f64 * pct / 100.0) as usize;
        let mut bar = String::from("[");
        for i in 0..width {
            bar.push(if i < filled {
                '='
            } else if i == filled {
                '>'
            } else {
                ' '
            });
        }
        bar.push_str(&format!(
            "] {:3.0}% {} ETA {}",
            pct,
            speed_string(self.speed_bps()),
            eta_string(self.eta_seconds())
        ));
        bar
    }
}

fn speed_string(bps: f64) -> String {
    if bps >= 1_000_000.0 {
        format!("{:.1} MB/s", bps / 1_000_000.0)
    } else if bps >= 1_000.0 {
        format!("{:.1} KB/s", bps / 1_000.0)
    } else {
        format!("{:.0} B/s", bps)
    }
}

fn eta_string(eta: Option<u64>) -> String {
    match eta {
        None => "?".to_string(),
        Some(secs) if secs < 60 => format!("{}s", secs),
        Some(secs) if secs < 3600 => format!("{}:{:02}", secs / 60, secs % 60),
        Some(secs) => format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_and_completion() {
        let progress = TransferProgress::new(200);
        assert_eq!(progress.percent(), 0.0);
        progress.update(50);
        assert_eq!(progress.percent(), 25.0);
        assert!(!progress.is_complete());
        progress.update(200);
        assert!(progress.is_complete());
    }

    #[test]
    fn zero_byte_transfer_is_complete() {
        let progress = TransferProgress::new(0);
        assert_eq!(progress.percent(), 100.0);
        assert!(progress.is_complete());
    }

    #[test]
    fn bar_renders_within_width() {
        let progress = TransferProgress::new(100);
        progress.update(56);
        let bar = progress.progress_bar(20);
        assert!(bar.starts_with('['));
        assert!(bar.contains("56%"));
    }
}
