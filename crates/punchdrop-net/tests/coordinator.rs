//! Coordination server/client integration over UDP loopback.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use punchdrop_net::coord_client::{CoordClient, CoordError};
use punchdrop_net::coord_server::CoordServer;
use punchdrop_proto::packet::{Packet, PacketType, MAX_DATAGRAM};

const PSK: &str = "test-psk";

struct RunningServer {
    server: Arc<CoordServer>,
    addr: SocketAddr,
    thread: std::thread::JoinHandle<()>,
}

fn start_server() -> RunningServer {
    let server = Arc::new(
        CoordServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            PSK,
            Duration::from_secs(300),
        )
        .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let runner = server.clone();
    let thread = std::thread::spawn(move || {
        runner.run().unwrap();
    });
    RunningServer {
        server,
        addr,
        thread,
    }
}

fn stop_server(running: RunningServer) {
    running.server.stop();
    running.thread.join().unwrap();
}

#[test]
fn two_peers_exchange_endpoints() {
    let running = start_server();
    let server_addr = running.addr;

    let sock_a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sock_b = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr_a = sock_a.local_addr().unwrap();
    let addr_b = sock_b.local_addr().unwrap();

    let handle_a = std::thread::spawn(move || {
        let mut client = CoordClient::new(&sock_a, server_addr, "pair", PSK);
        let remote = client.coordinate()?;
        Ok::<_, CoordError>((remote, client.my_public_endpoint()))
    });
    let handle_b = std::thread::spawn(move || {
        let mut client = CoordClient::new(&sock_b, server_addr, "pair", PSK);
        let remote = client.coordinate()?;
        Ok::<_, CoordError>((remote, client.my_public_endpoint()))
    });

    let (remote_a, _public_a) = handle_a.join().unwrap().unwrap();
    let (remote_b, _public_b) = handle_b.join().unwrap().unwrap();

    // Each side learns the other's observed endpoint.
    assert_eq!(remote_a, addr_b);
    assert_eq!(remote_b, addr_a);

    stop_server(running);
}

#[test]
fn third_peer_rejected_with_session_full() {
    let running = start_server();
    let server_addr = running.addr;

    let sock_a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sock_b = UdpSocket::bind("127.0.0.1:0").unwrap();
    let handle_a = std::thread::spawn(move || {
        CoordClient::new(&sock_a, server_addr, "full", PSK).coordinate()
    });
    let handle_b = std::thread::spawn(move || {
        CoordClient::new(&sock_b, server_addr, "full", PSK).coordinate()
    });
    handle_a.join().unwrap().unwrap();
    handle_b.join().unwrap().unwrap();

    let sock_c = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut client_c = CoordClient::new(&sock_c, server_addr, "full", PSK);
    match client_c.coordinate() {
        Err(CoordError::ServerRejected { code, message }) => {
            assert_eq!(code, 0x0001);
            assert_eq!(message, "Session full");
        }
        other => panic!("expected session-full rejection, got {:?}", other.map(|_| ())),
    }

    stop_server(running);
}

#[test]
fn wrong_psk_rejected_with_auth_failure() {
    let running = start_server();
    let server_addr = running.addr;

    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut client = CoordClient::new(&sock, server_addr, "authfail", "wrong-psk");
    match client.coordinate() {
        Err(CoordError::ServerRejected { code, message }) => {
            assert_eq!(code, 0x0002);
            assert_eq!(message, "Authentication failed");
        }
        other => panic!("expected auth rejection, got {:?}", other.map(|_| ())),
    }

    stop_server(running);
}

#[test]
fn reregister_returns_the_same_nonce() {
    let running = start_server();
    let server_addr = running.addr;

    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let register = {
        let id = b"renonce";
        let mut payload = vec![0u8, id.len() as u8];
        payload.extend_from_slice(id);
        Packet::new(PacketType::CoordRegister, payload).encode()
    };

    let mut nonces = Vec::new();
    for _ in 0..2 {
        sock.send_to(&register, server_addr).unwrap();
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = sock.recv_from(&mut buf).unwrap();
        let challenge = Packet::decode(&buf[..len]).unwrap();
        assert_eq!(challenge.packet_type, PacketType::CoordChallenge);
        assert_eq!(challenge.payload.len(), 32);
        nonces.push(challenge.payload);
    }
    assert_eq!(nonces[0], nonces[1]);

    stop_server(running);
}

#[test]
fn ping_answered_with_pong() {
    let running = start_server();
    let server_addr = running.addr;

    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    sock.send_to(&Packet::control(PacketType::CoordPing).encode(), server_addr)
        .unwrap();

    let mut buf = [0u8; MAX_DATAGRAM];
    let (len, _) = sock.recv_from(&mut buf).unwrap();
    let pong = Packet::decode(&buf[..len]).unwrap();
    assert_eq!(pong.packet_type, PacketType::CoordPong);

    stop_server(running);
}

#[test]
fn malformed_datagram_gets_no_response() {
    let running = start_server();
    let server_addr = running.addr;

    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    sock.send_to(b"garbage-not-a-packet", server_addr).unwrap();

    let mut buf = [0u8; MAX_DATAGRAM];
    assert!(
        sock.recv_from(&mut buf).is_err(),
        "server must stay silent on malformed datagrams"
    );

    stop_server(running);
}
