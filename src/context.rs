use crate::config::TunnelConfig;
use crate::device::InterfaceBridge;
use crate::flow::OverlayDialer;
use crate::logger::Logger;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Everything a router, resolver or flow needs from the engine: settings,
/// the log handle, the interface queues, the runtime that drives flow tasks
/// and the overlay dialer.
pub struct EngineContext {
    pub config: TunnelConfig,
    pub logger: Logger,
    pub interface: InterfaceBridge,
    pub runtime: Handle,
    pub dialer: Arc<dyn OverlayDialer>,
    identification: AtomicU16,
}

impl EngineContext {
    pub fn new(
        config: TunnelConfig,
        logger: Logger,
        interface: InterfaceBridge,
        runtime: Handle,
        dialer: Arc<dyn OverlayDialer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            logger,
            interface,
            runtime,
            dialer,
            identification: AtomicU16::new(rand::random()),
        })
    }

    /// IPv4 identification for the next synthesized packet.
    pub fn next_identification(&self) -> u16 {
        self.identification.fetch_add(1, Ordering::Relaxed)
    }
}
