use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

use punchdrop_net::coord_server::CoordServer;

pub fn run(port: u16, psk: &str, session_timeout_secs: u64) -> anyhow::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let server = CoordServer::bind(addr, psk, Duration::from_secs(session_timeout_secs))
        .with_context(|| format!("cannot bind UDP port {}", port))?;
    server.run().context("coordination server failed")
}
