use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use punchdrop_net::peer::PeerConnection;
use punchdrop_net::secure::PlainDriver;
use punchdrop_transfer::receiver::FileReceiver;
use punchdrop_transport::channel::ReliableChannel;

use crate::json;

use super::{format_size, resolve_server};

const CONNECTION_ID: u32 = 0xA;

pub fn run(
    session: &str,
    psk: &str,
    server: &str,
    output: &Path,
    json_mode: bool,
) -> anyhow::Result<()> {
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
        println!("Connected! Waiting for file offer...");
    }

    let router = conn
        .router()
        .context("router missing after connect")?
        .clone();
    let channel = ReliableChannel::new(router, CONNECTION_ID, conn.send_limit());
    let receiver = FileReceiver::new(output.to_path_buf(), channel.clone());

    let shared = Arc::new(ReceiverDisplay {
        receiver,
        done: AtomicBool::new(false),
    });
    let display_shared = shared.clone();
    let display = std::thread::spawn(move || {
        let mut announced = false;
        while !display_shared.done.load(Ordering::SeqCst) {
            if let Some(progress) = display_shared.receiver.progress() {
                if !announced {
                    if let Some(metadata) = display_shared.receiver.metadata() {
                        if json_mode {
                            json::file_info(&metadata);
                        } else {
                            println!(
                                "Receiving: {} ({})",
                                metadata.filename,
                                format_size(metadata.file_size)
                            );
                        }
                        announced = true;
                    }
                }
                if json_mode {
                    json::progress(&progress);
                } else {
                    print!("\r{}", progress.progress_bar(30));
                    use std::io::Write;
                    let _ = std::io::stdout().flush();
                }
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    });

    let result = shared.receiver.receive();
    shared.done.store(true, Ordering::SeqCst);
    let _ = display.join();

    match result {
        Ok(path) => {
            if let Some(progress) = shared.receiver.progress() {
                if json_mode {
                    json::complete_with_path(
                        progress.total(),
                        channel.packets_received(),
                        channel.retransmissions(),
                        progress.elapsed_ms(),
                        &path,
                    );
                } else {
                    println!("\r{}", progress.progress_bar(30));
                    println!("Transfer complete: {}", path.display());
                }
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

struct ReceiverDisplay {
    receiver: FileReceiver,
    done: AtomicBool,
}
