// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Raw packet source abstraction.
//!
//! A [`RawPacketSource`] pushes raw block packets into a registered callback,
//! one buffer per invocation and in arrival order. No ordering or loss
//! guarantee is made across invocations; the frame assembler copes with both.
//!
//! - **Testing**: [`TestSource`] delivers packets injected by the caller
//! - **Replay**: [`ReplaySource`] replays a packet list from its own thread
//! - **Live operation**: [`UdpSource`] reads from a UDP socket
//! - **Pcap replay**: `PcapSource` (with the `pcap` feature)
//!
//! # Example
//!
//! ```
//! use edgefirst_lidarstream::packet_source::{RawPacketSource, TestSource};
//! use std::sync::{
//!     Arc,
//!     atomic::{AtomicUsize, Ordering},
//! };
//!
//! let source = TestSource::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = seen.clone();
//! source
//!     .start(Arc::new(move |packet: &[u8]| {
//!         counter.fetch_add(packet.len(), Ordering::Relaxed);
//!     }))
//!     .unwrap();
//!
//! assert!(source.inject(&[1, 2, 3]));
//! source.stop().unwrap();
//! assert!(!source.inject(&[4, 5]));
//! assert_eq!(seen.load(Ordering::Relaxed), 3);
//! ```

use crate::lidar::{Error, Result};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::{
    io::ErrorKind,
    net::{ToSocketAddrs, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Callback receiving one raw packet per invocation.
pub type PacketCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Trait for raw packet sources.
///
/// After [`RawPacketSource::stop`] returns no new callback invocation
/// begins. Sources with their own delivery thread join it on stop, unless
/// stop is called from that thread.
pub trait RawPacketSource: Send + Sync {
    /// Begin delivering packets to `on_packet`.
    fn start(&self, on_packet: PacketCallback) -> Result<()>;

    /// Stop delivery. Stopping an idle source is a no-op.
    fn stop(&self) -> Result<()>;
}

/// Packet source driven by the caller, for unit testing.
///
/// Packets are delivered synchronously on the thread calling
/// [`TestSource::inject`].
#[derive(Default)]
pub struct TestSource {
    callback: Mutex<Option<PacketCallback>>,
    starts: AtomicU64,
    fail_start: AtomicBool,
}

impl TestSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one packet; returns false when the source is not started.
    pub fn inject(&self, packet: &[u8]) -> bool {
        // Clone out of the lock so the callback may call back into stop().
        let callback = self.callback.lock().clone();
        match callback {
            Some(callback) => {
                callback(packet);
                true
            }
            None => false,
        }
    }

    /// Deliver packets in order, returning how many were delivered.
    pub fn inject_all<I, P>(&self, packets: I) -> usize
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        packets
            .into_iter()
            .filter(|packet| self.inject(packet.as_ref()))
            .count()
    }

    pub fn is_started(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Number of successful `start` calls.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::Acquire)
    }

    /// Make subsequent `start` calls fail, simulating a dead transport.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Release);
    }
}

impl RawPacketSource for TestSource {
    fn start(&self, on_packet: PacketCallback) -> Result<()> {
        if self.fail_start.load(Ordering::Acquire) {
            return Err(Error::Source("test source refused to start".to_string()));
        }
        *self.callback.lock() = Some(on_packet);
        self.starts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.callback.lock().take();
        Ok(())
    }
}

/// Handle to a delivery thread.
struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))?;
        Ok(Self { running, handle })
    }

    fn shutdown(self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        if self.handle.thread().id() == thread::current().id() {
            // Stopped from inside its own callback; the loop exits on return.
            return Ok(());
        }
        self.handle
            .join()
            .map_err(|_| Error::Source("packet delivery thread panicked".to_string()))
    }
}

/// Replays a fixed packet list from a background thread.
pub struct ReplaySource {
    packets: Arc<Vec<Vec<u8>>>,
    interval: Duration,
    looping: bool,
    delivered: Arc<AtomicU64>,
    worker: Mutex<Option<Worker>>,
}

impl ReplaySource {
    pub fn new(packets: Vec<Vec<u8>>) -> Self {
        Self {
            packets: Arc::new(packets),
            interval: Duration::ZERO,
            looping: false,
            delivered: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    /// Delay between consecutive packets.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Restart from the first packet when the list is exhausted.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Packets delivered since construction.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::Acquire) && !w.handle.is_finished())
    }
}

impl RawPacketSource for ReplaySource {
    fn start(&self, on_packet: PacketCallback) -> Result<()> {
        let previous = self.worker.lock().take();
        if let Some(previous) = previous {
            previous.shutdown()?;
        }

        let packets = self.packets.clone();
        let delivered = self.delivered.clone();
        let interval = self.interval;
        let looping = self.looping;
        let worker = Worker::spawn("replay-source", move |running| {
            'replay: loop {
                for packet in packets.iter() {
                    if !running.load(Ordering::Acquire) {
                        break 'replay;
                    }
                    on_packet(packet);
                    delivered.fetch_add(1, Ordering::Relaxed);
                    if !interval.is_zero() {
                        thread::sleep(interval);
                    }
                }
                if !looping || packets.is_empty() {
                    break;
                }
            }
            debug!("replay source finished");
        })?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => worker.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!("replay source: {}", err);
        }
    }
}

/// UDP socket packet source for live sensor operation.
pub struct UdpSource {
    socket: UdpSocket,
    poll_interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl UdpSource {
    /// Create a new UDP source from an existing socket.
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            poll_interval: Duration::from_millis(100),
            worker: Mutex::new(None),
        }
    }

    /// Bind to an address and create a UDP source.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Ok(Self::new(UdpSocket::bind(addr)?))
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl RawPacketSource for UdpSource {
    fn start(&self, on_packet: PacketCallback) -> Result<()> {
        let previous = self.worker.lock().take();
        if let Some(previous) = previous {
            previous.shutdown()?;
        }

        let socket = self.socket.try_clone()?;
        // Bounded reads so stop() is observed promptly.
        socket.set_read_timeout(Some(self.poll_interval))?;
        let worker = Worker::spawn("udp-source", move |running| {
            let mut buf = vec![0u8; 65536];
            while running.load(Ordering::Acquire) {
                match socket.recv(&mut buf) {
                    Ok(len) => on_packet(&buf[..len]),
                    Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => {
                        warn!("udp source receive failed: {}", err);
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        })?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => worker.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for UdpSource {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!("udp source: {}", err);
        }
    }
}
