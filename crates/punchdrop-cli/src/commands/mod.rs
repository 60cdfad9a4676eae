pub mod receive;
pub mod send;
pub mod server;

use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::Context;

/// Resolve a `host:port` server argument to a socket address.
pub fn resolve_server(server: &str) -> anyhow::Result<SocketAddr> {
    server
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve server address '{}'", server))?
        .next()
        .with_context(|| format!("no address found for '{}'", server))
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1} GB", bytes as f64 / 1e9)
    } else if bytes >= 1_000_000 {
        format!("{:.1} MB", bytes as f64 / 1e6)
    } else if bytes >= 1_000 {
        format!("{:.1} KB", bytes as f64 / 1e3)
    } else {
        format!("{} B", bytes)
    }
}
