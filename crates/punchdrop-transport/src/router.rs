//! Single-threaded packet router: all transport I/O happens on one thread.
//!
//! External callers enqueue outbound datagrams via [`PacketRouter::send`];
//! the pump thread drains the queue, does a short blocking receive,
//! dispatches decoded packets to per-type handlers, and runs the periodic
//! tick. Serializing everything on one thread means the secure transport
//! needs no locking and sends, ticks and receives interleave strictly.
//!
//! Loop order per iteration:
//! 1. drain send queue
//! 2. receive once (10 ms timeout)
//! 3. dispatch (decode failures are logged and dropped)
//! 4. drain again (handlers may have enqueued)
//! 5. tick callback
//! 6. drain again (tick may have enqueued retransmits/SACKs)
//! 7. keepalive if nothing sent for 15 s
//! 8. declare the connection dead after 45 s of silence

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use punchdrop_proto::packet::{Packet, PacketType, MAX_DATAGRAM};

use crate::datagram::DatagramTransport;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const DEAD_AFTER: Duration = Duration::from_secs(45);

/// The router has been stopped (or was never started).
#[derive(Debug, Error)]
#[error("packet router is not running")]
pub struct RouterStopped;

type PacketHandler = Box<dyn Fn(Packet) + Send + Sync>;
type TickFn = Box<dyn FnMut() + Send>;

struct RouterInner {
    send_tx: Sender<Vec<u8>>,
    send_rx: Receiver<Vec<u8>>,
    handlers: RwLock<HashMap<PacketType, PacketHandler>>,
    tick: Mutex<Option<TickFn>>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the I/O pump. Cheap to clone; all clones share the pump.
#[derive(Clone)]
pub struct PacketRouter {
    inner: Arc<RouterInner>,
}

impl Default for PacketRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketRouter {
    pub fn new() -> PacketRouter {
        let (send_tx, send_rx) = unbounded();
        PacketRouter {
            inner: Arc::new(RouterInner {
                send_tx,
                send_rx,
                handlers: RwLock::new(HashMap::new()),
                tick: Mutex::new(None),
                running: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Register a handler for a packet type. KEEPALIVE and KEEPALIVE_ACK are
    /// always handled internally and never reach registered handlers.
    pub fn add_handler<F>(&self, packet_type: PacketType, handler: F)
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .insert(packet_type, Box::new(handler));
    }

    pub fn remove_handler(&self, packet_type: PacketType) {
        self.inner.handlers.write().remove(&packet_type);
    }

    /// Set the periodic callback, invoked once per loop iteration on the
    /// pump thread.
    pub fn set_tick_callback<F>(&self, tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.inner.tick.lock() = Some(Box::new(tick));
    }

    pub fn clear_tick_callback(&self) {
        *self.inner.tick.lock() = None;
    }

    /// Enqueue raw bytes for transmission. Thread-safe; returns immediately.
    pub fn send(&self, data: Vec<u8>) -> Result<(), RouterStopped> {
        if !self.is_running() {
            return Err(RouterStopped);
        }
        self.inner.send_tx.send(data).map_err(|_| RouterStopped)
    }

    /// Encode and enqueue a packet.
    pub fn send_packet(&self, packet: &Packet) -> Result<(), RouterStopped> {
        self.send(packet.encode())
    }

    /// Start the pump thread, which takes ownership of the transport.
    pub fn start(&self, transport: Box<dyn DatagramTransport>) {
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("packet-router".into())
            .spawn(move || run_loop(inner, transport))
            .expect("spawn packet-router thread");
        *self.inner.thread.lock() = Some(handle);
    }

    /// Stop the pump and wait for it to exit.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.join();
    }

    /// Block until the pump exits (connection dies or `stop` is called).
    pub fn await_stop(&self) {
        self.join();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn join(&self) {
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_loop(inner: Arc<RouterInner>, mut transport: Box<dyn DatagramTransport>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut last_send = Instant::now();
    let mut last_recv = Instant::now();

    while inner.running.load(Ordering::SeqCst) {
        if drain_send_queue(&inner, transport.as_mut(), &mut last_send).is_err() {
            break;
        }

        match transport.receive(&mut buf, RECEIVE_TIMEOUT) {
            Ok(Some(n)) => {
                last_recv = Instant::now();
                match Packet::decode(&buf[..n]) {
                    Ok(packet) => dispatch(&inner, transport.as_mut(), packet, &mut last_send),
                    Err(e) => debug!("ignoring malformed packet: {}", e),
                }
            }
            Ok(None) => {}
            Err(e) => {
                if inner.running.load(Ordering::SeqCst) {
                    warn!("receive loop I/O error: {}", e);
                }
                break;
            }
        }

        if drain_send_queue(&inner, transport.as_mut(), &mut last_send).is_err() {
            break;
        }

        {
            let mut tick = inner.tick.lock();
            if let Some(tick) = tick.as_mut() {
                tick();
            }
        }

        if drain_send_queue(&inner, transport.as_mut(), &mut last_send).is_err() {
            break;
        }

        let now = Instant::now();
        if now.duration_since(last_send) >= KEEPALIVE_INTERVAL {
            let keepalive = Packet::control(PacketType::Keepalive).encode();
            if transmit(transport.as_mut(), &keepalive, &mut last_send).is_err() {
                break;
            }
            debug!("sent keepalive");
        }

        if now.duration_since(last_recv) >= DEAD_AFTER {
            warn!(
                "peer unresponsive for {:?}, declaring connection dead",
                now.duration_since(last_recv)
            );
            break;
        }
    }

    inner.running.store(false, Ordering::SeqCst);
    debug!("packet router loop exited");
}

fn drain_send_queue(
    inner: &RouterInner,
    transport: &mut dyn DatagramTransport,
    last_send: &mut Instant,
) -> io::Result<()> {
    while let Ok(data) = inner.send_rx.try_recv() {
        transmit(transport, &data, last_send)?;
    }
    Ok(())
}

fn transmit(
    transport: &mut dyn DatagramTransport,
    data: &[u8],
    last_send: &mut Instant,
) -> io::Result<()> {
    transport.send(data).map_err(|e| {
        warn!("transport send error: {}", e);
        e
    })?;
    *last_send = Instant::now();
    Ok(())
}

fn dispatch(
    inner: &RouterInner,
    transport: &mut dyn DatagramTransport,
    packet: Packet,
    last_send: &mut Instant,
) {
    match packet.packet_type {
        PacketType::Keepalive => {
            let ack = Packet::control(PacketType::KeepaliveAck).encode();
            if let Err(e) = transmit(transport, &ack, last_send) {
                debug!("failed to send keepalive ack: {}", e);
            }
        }
        PacketType::KeepaliveAck => {
            debug!("received keepalive ack");
        }
        other => {
            let handlers = inner.handlers.read();
            match handlers.get(&other) {
                Some(handler) => handler(packet),
                None => debug!("no handler for packet type {:?}", other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::memory_pair;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn send_fails_when_stopped() {
        let router = PacketRouter::new();
        assert!(router.send(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn routes_packets_to_handlers() {
        let (a, b) = memory_pair(MAX_DATAGRAM);
        let router_a = PacketRouter::new();
        let router_b = PacketRouter::new();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_b = seen.clone();
        router_b.add_handler(PacketType::Data, move |pkt| {
            assert_eq!(pkt.payload, vec![0x42; 8]);
            seen_b.fetch_add(1, Ordering::SeqCst);
        });

        router_a.start(Box::new(a));
        router_b.start(Box::new(b));

        for _ in 0..3 {
            router_a
                .send_packet(&Packet::new(PacketType::Data, vec![0x42; 8]))
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        router_a.stop();
        router_b.stop();
    }

    #[test]
    fn keepalive_answered_internally() {
        let (a, b) = memory_pair(MAX_DATAGRAM);
        let router_b = PacketRouter::new();
        router_b.start(Box::new(b));

        let mut a = a;
        a.send(&Packet::control(PacketType::Keepalive).encode())
            .unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let n = a
            .receive(&mut buf, Duration::from_secs(2))
            .unwrap()
            .expect("expected keepalive ack");
        let pkt = Packet::decode(&buf[..n]).unwrap();
        assert_eq!(pkt.packet_type, PacketType::KeepaliveAck);

        router_b.stop();
    }

    #[test]
    fn tick_runs_every_iteration() {
        let (a, _keep) = memory_pair(MAX_DATAGRAM);
        let router = PacketRouter::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        router.set_tick_callback(move || {
            t.fetch_add(1, Ordering::SeqCst);
        });
        router.start(Box::new(a));
        std::thread::sleep(Duration::from_millis(200));
        router.stop();
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn loop_exits_when_transport_dies() {
        let (a, b) = memory_pair(MAX_DATAGRAM);
        let router = PacketRouter::new();
        router.start(Box::new(a));
        assert!(router.is_running());
        drop(b);
        let deadline = Instant::now() + Duration::from_secs(2);
        while router.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!router.is_running());
        router.await_stop();
    }
}
