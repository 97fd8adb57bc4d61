//! Recording doubles for the overlay capability and a small engine harness
//! shared by the flow, router and FFI tests.

use crate::config::TunnelConfig;
use crate::context::EngineContext;
use crate::device::InterfaceBridge;
use crate::flow::{DataCallback, DialTarget, OverlayConnection, OverlayDialer, OverlayError};
use crate::logger::Logger;
use crate::packet::{IpPacket, TcpPacket};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::Notify;

#[derive(Default)]
pub(crate) struct RecordingOverlay {
    pub written: Mutex<Vec<u8>>,
    pub on_data: Mutex<Option<DataCallback>>,
    pub closed: AtomicBool,
    pub refuse_connect: bool,
    pub fail_writes: bool,
}

impl RecordingOverlay {
    /// Plays the remote side: bytes, or `None` for end of stream.
    pub fn deliver(&self, data: Option<&[u8]>) {
        if let Some(callback) = self.on_data.lock().as_ref() {
            callback(data);
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl OverlayConnection for RecordingOverlay {
    fn connect(&self, on_data: DataCallback) -> bool {
        if self.refuse_connect {
            return false;
        }
        *self.on_data.lock() = Some(on_data);
        true
    }

    fn write(&self, data: &[u8]) -> Result<usize, OverlayError> {
        if self.fail_writes {
            return Err(OverlayError::Write("connection reset".into()));
        }
        self.written.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out the same overlay for every dial, or nothing when unreachable.
pub(crate) struct StubDialer {
    pub overlay: Option<Arc<RecordingOverlay>>,
    pub dials: Mutex<Vec<DialTarget>>,
}

impl StubDialer {
    pub fn new(overlay: Option<Arc<RecordingOverlay>>) -> Self {
        Self {
            overlay,
            dials: Mutex::new(Vec::new()),
        }
    }
}

impl OverlayDialer for StubDialer {
    fn open(&self, target: &DialTarget) -> Option<Arc<dyn OverlayConnection>> {
        self.dials.lock().push(target.clone());
        self.overlay
            .clone()
            .map(|overlay| overlay as Arc<dyn OverlayConnection>)
    }
}

pub(crate) struct TestEngine {
    _runtime: Runtime,
    pub context: Arc<EngineContext>,
    pub overlay: Arc<RecordingOverlay>,
    pub dialer: Arc<StubDialer>,
}

impl TestEngine {
    pub fn new(config: TunnelConfig, overlay: Option<RecordingOverlay>) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap();
        let overlay = overlay.map(Arc::new);
        let dialer = Arc::new(StubDialer::new(overlay.clone()));
        let interface = InterfaceBridge::new(config.mtu, Arc::new(Notify::new()), 256);
        let context = EngineContext::new(
            config,
            Logger::new(),
            interface,
            runtime.handle().clone(),
            Arc::clone(&dialer) as Arc<dyn OverlayDialer>,
        );
        Self {
            _runtime: runtime,
            context,
            overlay: overlay.unwrap_or_default(),
            dialer,
        }
    }

    pub fn reachable() -> Self {
        Self::new(TunnelConfig::default(), Some(RecordingOverlay::default()))
    }

    pub fn outbound(&self) -> Vec<IpPacket> {
        self.context.interface.drain_outbound()
    }

    /// Polls the interface until `count` packets arrived or a second passed.
    pub fn wait_outbound(&self, count: usize) -> Vec<IpPacket> {
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut sent = Vec::new();
        while sent.len() < count && Instant::now() < deadline {
            sent.extend(self.outbound());
            std::thread::sleep(Duration::from_millis(5));
        }
        sent
    }

    pub fn sent_segments(&self) -> Vec<TcpPacket> {
        to_segments(self.outbound())
    }

    pub fn wait_segments(&self, count: usize) -> Vec<TcpPacket> {
        to_segments(self.wait_outbound(count))
    }
}

fn to_segments(packets: Vec<IpPacket>) -> Vec<TcpPacket> {
    packets
        .into_iter()
        .map(|ip| TcpPacket::parse(ip).unwrap())
        .collect()
}
