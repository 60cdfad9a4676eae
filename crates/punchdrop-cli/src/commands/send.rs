use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};

use punchdrop_net::peer::PeerConnection;
use punchdrop_net::secure::PlainDriver;
use punchdrop_proto::metadata::FileMetadata;
use punchdrop_transfer::sender::FileSender;
use punchdrop_transport::channel::ReliableChannel;

use crate::json;

use super::{format_size, resolve_server};

const CONNECTION_ID: u32 = 0xA;

pub fn run(
    session: &str,
    psk: &str,
    server: &str,
    file: &Path,
    json_mode: bool,
) -> anyhow::Result<()> {
    if !file.exists() {
        bail!("file not found: {}", file.display());
    }
    if !file.is_file() {
        bail!("not a regular file: {}", file.display());
    }

    if !json_mode {
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        println!(
            "File: {} ({})",
            file.file_name().unwrap_or_default().to_string_lossy(),
            format_size(size)
        );
        println!("Computing SHA-256...");
    }
    let metadata = FileMetadata::from_file(file).context("cannot read file")?;
    if json_mode {
        json::file_info(&metadata);
    } else {
        println!("SHA-256: {}", metadata.sha256_hex());
    }

    let server_addr = resolve_server(server)?;
    let mut conn = PeerConnection::new(server_addr, session, psk);
    if json_mode {
        conn.set_state_listener(json::status);
    }

    if !json_mode {
        println!("Connecting to session '{}' via {}...", session, server_addr);
    }
    conn.connect(&mut PlainDriver)
        .context("peer connection failed")?;
    if !json_mode {
        println!("Connected! Encrypted P2P link established.");
        if let Some(remote) = conn.remote_endpoint() {
            println!("  Remote endpoint: {}", remote);
        }
    }

    let router = conn
        .router()
        .context("router missing after connect")?
        .clone();
    let channel = ReliableChannel::new(router, CONNECTION_ID, conn.send_limit());
    let sender = FileSender::new(file.to_path_buf(), metadata, channel.clone());

    // Progress display runs beside the blocking send.
    let progress = sender.progress();
    let done = Arc::new(AtomicBool::new(false));
    let display_done = done.clone();
    let display = std::thread::spawn(move || {
        while !display_done.load(Ordering::SeqCst) {
            if json_mode {
                json::progress(&progress);
            } else {
                print!("\r{}", progress.progress_bar(30));
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    });

    let result = sender.send();
    done.store(true, Ordering::SeqCst);
    let _ = display.join();

    match result {
        Ok(()) => {
            let progress = sender.progress();
            if json_mode {
                json::complete(
                    progress.total(),
                    channel.packets_sent(),
                    channel.retransmissions(),
                    progress.elapsed_ms(),
                );
            } else {
                println!("\r{}", progress.progress_bar(30));
                println!("Transfer complete!");
                println!(
                    "  {} sent, {} packets, {} retransmissions",
                    format_size(progress.total()),
                    channel.packets_sent(),
                    channel.retransmissions()
                );
            }
            channel.close();
            conn.close();
            Ok(())
        }
        Err(e) => {
            channel.close();
            conn.close();
            Err(e).context("transfer failed")
        }
    }
}
