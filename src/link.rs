//! Byte transports under the codec.
//!
//! A transport moves opaque frame buffers; it never looks inside them.
//! Reads are blocking and run on `spawn_blocking` threads, so `close`
//! must be able to unstick a reader from another thread.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::error::LinkError;

/// How often a blocked reader re-checks the closed flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub trait LinkTransport: Send + Sync {
    /// Block until one frame-sized buffer arrives.
    fn read_frame(&self) -> Result<Vec<u8>, LinkError>;
    fn write_frame(&self, buf: &[u8]) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
    /// Idempotent. Pending and future reads fail with [`LinkError::Closed`].
    fn close(&self);
}

/// UDP link. Each datagram is one frame, which matches how MAVLink
/// endpoints packetize. The peer address is pinned to whoever sent the
/// first datagram, so the station can listen before it knows the
/// vehicle's address.
pub struct UdpLink {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

impl UdpLink {
    /// Listen on `local` and wait for the vehicle to talk first.
    pub fn bind<A: ToSocketAddrs>(local: A) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            socket,
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Listen on `local` with the vehicle's address known up front.
    pub fn connect<A: ToSocketAddrs>(local: A, remote: SocketAddr) -> Result<Self, LinkError> {
        let link = Self::bind(local)?;
        *link.peer.lock().unwrap() = Some(remote);
        Ok(link)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.socket.local_addr()?)
    }
}

impl LinkTransport for UdpLink {
    fn read_frame(&self) -> Result<Vec<u8>, LinkError> {
        let mut buf = [0u8; mavlink::MAX_FRAME_SIZE * 4];
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(LinkError::Closed);
            }
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let mut peer = self.peer.lock().unwrap();
                    if peer.map(|p| p != from).unwrap_or(true) {
                        debug!(%from, "udp peer pinned");
                        *peer = Some(from);
                    }
                    return Ok(buf[..n].to_vec());
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_frame(&self, buf: &[u8]) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let peer = self.peer.lock().unwrap().ok_or(LinkError::Closed)?;
        self.socket.send_to(buf, peer)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.peer.lock().unwrap().is_some()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// In-process transport for tests: two of these, cross-wired, emulate a
/// station/vehicle pair without sockets.
pub struct MemoryLink {
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryLink {
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let (a_tx, a_rx) = std::sync::mpsc::channel();
        let (b_tx, b_rx) = std::sync::mpsc::channel();
        (
            MemoryLink {
                tx: a_tx,
                rx: Mutex::new(b_rx),
                closed: AtomicBool::new(false),
            },
            MemoryLink {
                tx: b_tx,
                rx: Mutex::new(a_rx),
                closed: AtomicBool::new(false),
            },
        )
    }
}

impl LinkTransport for MemoryLink {
    fn read_frame(&self) -> Result<Vec<u8>, LinkError> {
        let rx = self.rx.lock().unwrap();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(LinkError::Closed);
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(buf) => return Ok(buf),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(LinkError::Closed),
            }
        }
    }

    fn write_frame(&self, buf: &[u8]) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        self.tx.send(buf.to_vec()).map_err(|_| LinkError::Closed)
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pair_moves_frames_both_ways() {
        let (station, vehicle) = MemoryLink::pair();
        station.write_frame(b"to-vehicle").unwrap();
        assert_eq!(vehicle.read_frame().unwrap(), b"to-vehicle");
        vehicle.write_frame(b"to-station").unwrap();
        assert_eq!(station.read_frame().unwrap(), b"to-station");
    }

    #[test]
    fn closed_memory_link_rejects_io() {
        let (station, _vehicle) = MemoryLink::pair();
        station.close();
        assert!(matches!(station.read_frame(), Err(LinkError::Closed)));
        assert!(matches!(
            station.write_frame(b"x"),
            Err(LinkError::Closed)
        ));
        assert!(!station.is_connected());
    }

    #[test]
    fn udp_write_before_any_peer_is_an_error() {
        let link = UdpLink::bind("127.0.0.1:0").unwrap();
        assert!(matches!(link.write_frame(b"x"), Err(LinkError::Closed)));
        assert!(!link.is_connected());
    }

    #[test]
    fn udp_pins_peer_from_first_datagram() {
        let station = UdpLink::bind("127.0.0.1:0").unwrap();
        let vehicle = UdpSocket::bind("127.0.0.1:0").unwrap();
        vehicle
            .send_to(b"hello", station.local_addr().unwrap())
            .unwrap();
        assert_eq!(station.read_frame().unwrap(), b"hello");
        assert!(station.is_connected());

        station.write_frame(b"reply").unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = vehicle.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
    }
}
