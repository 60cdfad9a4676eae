//! Loopback tests for the reliable channel: two full router/channel stacks
//! over an in-memory datagram pair, with and without simulated loss.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use punchdrop_proto::packet::MAX_DATAGRAM;
use punchdrop_transport::{
    memory_pair, DatagramTransport, MemoryTransport, PacketRouter, ReliableChannel,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// Drops a deterministic fraction of outbound datagrams. The first few sends
/// always pass so the receive buffer can lock onto the initial sequence.
struct LossyTransport {
    inner: MemoryTransport,
    counter: usize,
}

impl DatagramTransport for LossyTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.counter += 1;
        if self.counter > 5 && self.counter % 7 == 0 {
            return Ok(()); // dropped on the floor
        }
        self.inner.send(data)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        self.inner.receive(buf, timeout)
    }

    fn send_limit(&self) -> usize {
        self.inner.send_limit()
    }
}

struct Harness {
    router_a: PacketRouter,
    router_b: PacketRouter,
    channel_a: ReliableChannel,
    channel_b: ReliableChannel,
}

fn start_pair(lossy: bool) -> Harness {
    let (a, b) = memory_pair(MAX_DATAGRAM);
    let router_a = PacketRouter::new();
    let router_b = PacketRouter::new();
    let channel_a = ReliableChannel::new(router_a.clone(), 0xA, MAX_DATAGRAM);
    let channel_b = ReliableChannel::new(router_b.clone(), 0xA, MAX_DATAGRAM);

    if lossy {
        router_a.start(Box::new(LossyTransport {
            inner: a,
            counter: 0,
        }));
    } else {
        router_a.start(Box::new(a));
    }
    router_b.start(Box::new(b));

    Harness {
        router_a,
        router_b,
        channel_a,
        channel_b,
    }
}

fn shutdown(h: Harness) {
    h.channel_a.close();
    h.channel_b.close();
    h.router_a.stop();
    h.router_b.stop();
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn ordered_delivery_over_clean_link() {
    init_tracing();
    let h = start_pair(false);

    const COUNT: u32 = 300;
    let received: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    h.channel_b.on_data_received(move |payload| {
        sink.lock().push(payload.chunk_index);
    });

    for i in 0..COUNT {
        let body = vec![(i % 251) as u8; 100];
        h.channel_a
            .send_data(i, i as u64 * 100, &body)
            .expect("send_data");
    }

    assert!(
        wait_for(Duration::from_secs(10), || received.lock().len()
            == COUNT as usize),
        "only {}/{} packets delivered",
        received.lock().len(),
        COUNT
    );

    // Delivery happens in send order.
    let seen = received.lock();
    let expected: Vec<u32> = (0..COUNT).collect();
    assert_eq!(*seen, expected);
    drop(seen);

    shutdown(h);
}

#[test]
fn lossy_link_recovers_via_retransmission() {
    init_tracing();
    let h = start_pair(true);

    const COUNT: u32 = 200;
    let received: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    h.channel_b.on_data_received(move |payload| {
        sink.lock().push(payload.chunk_index);
    });

    for i in 0..COUNT {
        h.channel_a
            .send_data(i, i as u64 * 64, &vec![0xCC; 64])
            .expect("send_data");
    }

    assert!(
        wait_for(Duration::from_secs(30), || received.lock().len()
            == COUNT as usize),
        "only {}/{} packets delivered over lossy link",
        received.lock().len(),
        COUNT
    );

    let seen = received.lock();
    let expected: Vec<u32> = (0..COUNT).collect();
    assert_eq!(*seen, expected, "delivery must stay in order despite loss");
    drop(seen);

    assert!(
        h.channel_a.retransmissions() > 0,
        "loss should have forced retransmissions"
    );

    shutdown(h);
}

#[test]
fn all_acked_fires_when_window_drains() {
    init_tracing();
    let h = start_pair(false);

    let all_acked = Arc::new(AtomicBool::new(false));
    let flag = all_acked.clone();
    h.channel_a.on_all_acked(move || {
        flag.store(true, Ordering::SeqCst);
    });
    h.channel_b.on_data_received(|_| {});

    for i in 0..10u32 {
        h.channel_a.send_data(i, 0, b"payload").expect("send_data");
    }

    assert!(
        wait_for(Duration::from_secs(5), || all_acked.load(Ordering::SeqCst)),
        "all-acked callback never fired"
    );
    assert_eq!(h.channel_a.inflight_count(), 0);

    shutdown(h);
}
