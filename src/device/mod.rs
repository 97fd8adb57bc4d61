//! Interface bridge: the queues between the virtual-interface driver and the
//! packet-processing loop.
//!
//! The driver side pushes raw frames in and drains synthesized packets out;
//! the engine side pops inbound frames and pushes outbound packets. Both
//! directions share one mutex and wake the engine's poll loop through a
//! `Notify`, so neither side ever blocks on the other.

use crate::packet::{IpHeader, IpPacket};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub const MAX_EMIT_BATCH: usize = 64;
pub const MIN_RING_CAPACITY: usize = 16;

struct SharedRing {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<IpPacket>,
    capacity: usize,
}

impl SharedRing {
    fn new(capacity: usize) -> Self {
        Self {
            inbound: VecDeque::with_capacity(capacity),
            outbound: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

#[derive(Default)]
struct RingCounters {
    inbound_rejected: AtomicU64,
    inbound_evicted: AtomicU64,
    outbound_evicted: AtomicU64,
}

/// Frames dropped at the bridge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeDrops {
    pub inbound_rejected: u64,
    pub inbound_evicted: u64,
    pub outbound_evicted: u64,
}

/// Cloneable handle shared by the driver callbacks, the router and every flow.
#[derive(Clone)]
pub struct InterfaceBridge {
    inner: Arc<Mutex<SharedRing>>,
    counters: Arc<RingCounters>,
    wake: Arc<Notify>,
    mtu: usize,
}

impl InterfaceBridge {
    pub fn new(mtu: usize, wake: Arc<Notify>, ring_capacity: usize) -> Self {
        let capacity = ring_capacity.max(MIN_RING_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(SharedRing::new(capacity))),
            counters: Arc::new(RingCounters::default()),
            wake,
            mtu: mtu.max(576),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Pushes a copy of `packet` into the inbound ring, evicting the oldest
    /// frame when full. Returns `false` if the frame fails basic IP header
    /// validation or exceeds the MTU.
    pub fn push_inbound(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return true;
        }
        if packet.len() > self.mtu || IpPacket::check(packet).is_err() {
            self.counters.inbound_rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut guard = self.inner.lock();
        if guard.inbound.len() >= guard.capacity {
            guard.inbound.pop_front();
            self.counters.inbound_evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.inbound.push_back(packet.to_vec());
        drop(guard);
        self.wake.notify_one();
        true
    }

    /// Takes up to `max` inbound frames in arrival order.
    pub fn drain_inbound(&self, max: usize) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock();
        let count = max.min(guard.inbound.len());
        guard.inbound.drain(..count).collect()
    }

    /// Queues a finished packet for the interface. Lengths and checksums must
    /// already be final; the packet is emitted byte for byte.
    pub fn push_outbound(&self, packet: IpPacket) {
        let mut guard = self.inner.lock();
        if guard.outbound.len() >= guard.capacity {
            guard.outbound.pop_front();
            self.counters.outbound_evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.outbound.push_back(packet);
        drop(guard);
        self.wake.notify_one();
    }

    /// Drains up to `MAX_EMIT_BATCH` outbound packets.
    pub fn drain_outbound(&self) -> Vec<IpPacket> {
        let mut guard = self.inner.lock();
        let drain_count = MAX_EMIT_BATCH.min(guard.outbound.len());
        guard.outbound.drain(..drain_count).collect()
    }

    pub fn inbound_queue_len(&self) -> usize {
        self.inner.lock().inbound.len()
    }

    pub fn outbound_queue_len(&self) -> usize {
        self.inner.lock().outbound.len()
    }

    pub fn drops(&self) -> BridgeDrops {
        BridgeDrops {
            inbound_rejected: self.counters.inbound_rejected.load(Ordering::Relaxed),
            inbound_evicted: self.counters.inbound_evicted.load(Ordering::Relaxed),
            outbound_evicted: self.counters.outbound_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Splits drained packets into the parallel arrays the host's emit callback
/// takes: frame bytes and address family per frame.
pub fn frames_with_families(packets: Vec<IpPacket>) -> (Vec<Vec<u8>>, Vec<u32>) {
    let mut frames = Vec::with_capacity(packets.len());
    let mut families = Vec::with_capacity(packets.len());
    for packet in packets {
        families.push(packet.version().address_family());
        frames.push(packet.into_bytes());
    }
    (frames, families)
}
