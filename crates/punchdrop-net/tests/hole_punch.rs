//! Hole punching over UDP loopback.

use std::net::UdpSocket;
use std::time::Duration;

use punchdrop_net::hole_punch::HolePuncher;

#[test]
fn two_sockets_punch_through_quickly() {
    let sock_a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sock_b = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr_a = sock_a.local_addr().unwrap();
    let addr_b = sock_b.local_addr().unwrap();

    let handle_a = std::thread::spawn(move || {
        let mut puncher = HolePuncher::new(&sock_a, addr_b, 0xAAAA_AAAA);
        puncher.punch()
    });
    let handle_b = std::thread::spawn(move || {
        let mut puncher = HolePuncher::new(&sock_b, addr_a, 0xBBBB_BBBB);
        puncher.punch()
    });

    let result_a = handle_a.join().unwrap();
    let result_b = handle_b.join().unwrap();

    assert!(result_a.success && result_b.success);
    assert!(result_a.elapsed < Duration::from_secs(5));
    assert!(result_b.elapsed < Duration::from_secs(5));
    assert_eq!(result_a.confirmed_endpoint, Some(addr_b));
    assert_eq!(result_b.confirmed_endpoint, Some(addr_a));
}

#[test]
fn unresponsive_target_fails_near_the_deadline() {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    // Bound but never sends or replies.
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let silent_addr = silent.local_addr().unwrap();

    let timeout = Duration::from_millis(600);
    let mut puncher =
        HolePuncher::with_timing(&sock, silent_addr, 0x1, Duration::from_millis(50), timeout);
    let result = puncher.punch();

    assert!(!result.success);
    assert!(result.confirmed_endpoint.is_none());
    assert!(result.elapsed >= timeout);
    assert!(result.elapsed < timeout + Duration::from_secs(1));
}
