//! Full connection flow on loopback: coordination, hole punch, plain
//! handshake, and a packet exchanged through both routers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use punchdrop_net::coord_server::CoordServer;
use punchdrop_net::peer::{PeerConnection, PeerState};
use punchdrop_net::secure::PlainDriver;
use punchdrop_proto::packet::{Packet, PacketType};

const PSK: &str = "loopback-psk";

#[test]
fn peers_connect_and_exchange_a_packet() {
    let server = Arc::new(
        CoordServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            PSK,
            Duration::from_secs(300),
        )
        .unwrap(),
    );
    let server_addr = server.local_addr().unwrap();
    let server_runner = server.clone();
    let server_thread = std::thread::spawn(move || server_runner.run().unwrap());

    let handle_a = std::thread::spawn(move || {
        let mut conn = PeerConnection::new(server_addr, "loop", PSK);
        conn.connect(&mut PlainDriver)?;
        Ok::<_, punchdrop_net::peer::PeerError>(conn)
    });
    let handle_b = std::thread::spawn(move || {
        let mut conn = PeerConnection::new(server_addr, "loop", PSK);
        conn.connect(&mut PlainDriver)?;
        Ok::<_, punchdrop_net::peer::PeerError>(conn)
    });

    let mut conn_a = handle_a.join().unwrap().expect("peer A connects");
    let mut conn_b = handle_b.join().unwrap().expect("peer B connects");

    assert_eq!(conn_a.state(), PeerState::Connected);
    assert_eq!(conn_b.state(), PeerState::Connected);
    assert!(conn_a.send_limit() > 0);

    // Route one control packet from A to B.
    let got_cancel = Arc::new(AtomicBool::new(false));
    let flag = got_cancel.clone();
    conn_b
        .router()
        .unwrap()
        .add_handler(PacketType::Cancel, move |_| {
            flag.store(true, Ordering::SeqCst);
        });
    conn_a
        .router()
        .unwrap()
        .send_packet(&Packet::control(PacketType::Cancel))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !got_cancel.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(got_cancel.load(Ordering::SeqCst), "packet never routed");

    conn_a.close();
    conn_b.close();
    server.stop();
    server_thread.join().unwrap();
}
