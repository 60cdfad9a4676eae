//! Newline-delimited JSON events on stdout for machine consumers.

use std::io::Write;

use serde::Serialize;

use punchdrop_net::peer::PeerState;
use punchdrop_proto::metadata::FileMetadata;
use punchdrop_transfer::progress::TransferProgress;

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Status {
        state: &'a str,
    },
    FileInfo {
        name: &'a str,
        size: u64,
        sha256: String,
    },
    Progress {
        bytes: u64,
        total: u64,
        speed_bps: u64,
        eta_seconds: i64,
        percent: f64,
    },
    Complete {
        bytes: u64,
        packets: u64,
        retransmissions: u64,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Error {
        message: &'a str,
    },
}

fn emit(event: &Event) {
    if let Ok(line) = serde_json::to_string(event) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }
}

pub fn status(state: PeerState) {
    let name = match state {
        PeerState::Init => "init",
        PeerState::Registering => "registering",
        PeerState::WaitingPeer => "waiting_peer",
        PeerState::Punching => "punching",
        PeerState::Handshake => "handshaking",
        PeerState::Connected => "connected",
        PeerState::Error => "error",
    };
    emit(&Event::Status { state: name });
}

pub fn file_info(metadata: &FileMetadata) {
    emit(&Event::FileInfo {
        name: &metadata.filename,
        size: metadata.file_size,
        sha256: metadata.sha256_hex(),
    });
}

pub fn progress(progress: &TransferProgress) {
    emit(&Event::Progress {
        bytes: progress.transferred(),
        total: progress.total(),
        speed_bps: progress.speed_bps() as u64,
        eta_seconds: progress.eta_seconds().map(|s| s as i64).unwrap_or(-1),
        percent: (progress.percent() * 10.0).round() / 10.0,
    });
}

pub fn complete(bytes: u64, packets: u64, retransmissions: u64, duration_ms: u64) {
    emit(&Event::Complete {
        bytes,
        packets,
        retransmissions,
        duration_ms,
        path: None,
    });
}

pub fn complete_with_path(
    bytes: u64,
    packets: u64,
    retransmissions: u64,
    duration_ms: u64,
    path: &std::path::Path,
) {
    emit(&Event::Complete {
        bytes,
        packets,
        retransmissions,
        duration_ms,
        path: Some(path.display().to_string()),
    });
}

pub fn error(message: &str) {
    emit(&Event::Error { message });
}
