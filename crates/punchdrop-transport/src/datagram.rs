//! The secure-datagram abstraction the transport stack runs on.
//!
//! In production this is the post-handshake DTLS transport; in tests and on
//! loopback it is an in-memory channel pair. The router is the only component
//! that calls these methods, always from its own thread.

use std::io;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

/// One encrypted (or otherwise framed) datagram pipe to the remote peer.
pub trait DatagramTransport: Send {
    /// Send one datagram.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receive one datagram into `buf`. Returns `Ok(None)` on timeout.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// Largest datagram `send` accepts.
    fn send_limit(&self) -> usize;
}

/// In-memory datagram transport: lossless, ordered, bidirectional when
/// created as a pair. Used by loopback tests and local development.
pub struct MemoryTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    send_limit: usize,
}

/// Create a connected pair of in-memory transports.
pub fn memory_pair(send_limit: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    (
        MemoryTransport {
            tx: a_tx,
            rx: a_rx,
            send_limit,
        },
        MemoryTransport {
            tx: b_tx,
            rx: b_rx,
            send_limit,
        },
    )
}

impl DatagramTransport for MemoryTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer transport dropped"))
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        match self.rx.recv_timeout(timeout) {
            Ok(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Some(n))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer transport dropped",
            )),
        }
    }

    fn send_limit(&self) -> usize {
        self.send_limit
    }
}
