#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod context;
pub mod device;
pub mod dns;
pub mod error;
pub mod ffi;
pub mod flow;
pub mod logger;
pub mod packet;
pub mod resolver;
pub mod router;

#[cfg(test)]
mod test_support;

use crate::config::{FallbackResolver, TunnelConfig};
use crate::context::EngineContext;
use crate::device::{frames_with_families, InterfaceBridge, MAX_EMIT_BATCH};
use crate::dns::{Resolver, SystemResolver, UpstreamResolver, UPSTREAM_TIMEOUT};
use crate::error::BridgeError;
use crate::ffi::{
    read_c_str, BridgeCallbacks, BridgeConfig, BridgeLogSink, CallbackDialer, FlowCounters,
    OverlayRegistry,
};
use crate::logger::{BreadcrumbFlags, Logger};
use crate::resolver::DnsResolver;
use crate::router::PacketRouter;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Opaque engine handle shared with the host.
pub struct BridgeEngine {
    callbacks: Arc<OnceCell<BridgeCallbacks>>,
    runtime: Runtime,
    context: Arc<EngineContext>,
    router: Arc<PacketRouter>,
    overlays: Arc<OverlayRegistry>,
    state: Arc<Mutex<EngineState>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    wake: Arc<Notify>,
}

struct EngineState {
    running: bool,
}

impl BridgeEngine {
    pub fn new(config: TunnelConfig) -> anyhow::Result<Self> {
        config.validate().map_err(BridgeError::Config)?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(8)
            .enable_time()
            .build()?;

        let logger = Logger::new();
        let wake = Arc::new(Notify::new());
        let interface = InterfaceBridge::new(config.mtu, Arc::clone(&wake), config.ring_capacity);
        let callbacks = Arc::new(OnceCell::new());
        let overlays = Arc::new(OverlayRegistry::default());
        let dialer = CallbackDialer::new(
            Arc::clone(&callbacks),
            Arc::clone(&overlays),
            logger.clone(),
        );

        let fallback: Arc<dyn Resolver> = match config.fallback {
            FallbackResolver::System => Arc::new(SystemResolver::default()),
            FallbackResolver::Upstream => Arc::new(UpstreamResolver::new(
                &config.dns_proxies,
                UPSTREAM_TIMEOUT,
            )),
        };
        let resolver = Arc::new(DnsResolver::new(&config, fallback, logger.clone()));

        let summary = format!(
            "BridgeEngine initialized (ip={}, mtu={}, ring_cap={}, fallback={})",
            config.ip,
            config.mtu,
            config.ring_capacity,
            config.fallback.as_str()
        );
        let context = EngineContext::new(
            config,
            logger,
            interface,
            runtime.handle().clone(),
            Arc::new(dialer),
        );
        let router = Arc::new(PacketRouter::new(Arc::clone(&context), resolver));
        context.logger.breadcrumb(BreadcrumbFlags::DEVICE, summary);

        Ok(Self {
            callbacks,
            runtime,
            context,
            router,
            overlays,
            state: Arc::new(Mutex::new(EngineState { running: false })),
            poll_task: Mutex::new(None),
            wake,
        })
    }

    pub fn logger(&self) -> &Logger {
        &self.context.logger
    }

    pub fn router(&self) -> &PacketRouter {
        &self.router
    }

    pub fn start(&self, callbacks: BridgeCallbacks) -> anyhow::Result<()> {
        self.logger()
            .breadcrumb(BreadcrumbFlags::DEVICE, "BridgeEngine start requested");
        self.callbacks
            .set(callbacks)
            .map_err(|_| anyhow::anyhow!("callbacks already installed"))?;
        self.state.lock().running = true;
        self.start_poll_loop();
        self.logger()
            .breadcrumb(BreadcrumbFlags::DEVICE, "BridgeEngine poll loop running");
        Ok(())
    }

    pub fn stop(&self) {
        self.logger()
            .breadcrumb(BreadcrumbFlags::DEVICE, "BridgeEngine stop requested");
        self.state.lock().running = false;
        self.wake.notify_waiters();
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
        }
        self.router.shutdown();
        self.logger()
            .breadcrumb(BreadcrumbFlags::DEVICE, "BridgeEngine stopped");
    }

    /// Queues a frame read from the interface. `false` when the frame was
    /// rejected by the bridge.
    pub fn handle_packet(&self, packet: &[u8], protocol: u32) -> bool {
        let accepted = self.context.interface.push_inbound(packet);
        if !accepted {
            self.logger().breadcrumb_with(BreadcrumbFlags::DEVICE, || {
                format!(
                    "Dropped packet (len={}, proto=0x{:x}) at the bridge",
                    packet.len(),
                    protocol
                )
            });
        }
        accepted
    }

    pub fn on_overlay_data(&self, handle: u64, payload: &[u8]) -> bool {
        self.overlays.deliver(handle, payload)
    }

    pub fn on_overlay_close(&self, handle: u64) -> bool {
        self.overlays.close(handle)
    }

    pub fn add_hostname(&self, hostname: &str, service_id: &str) -> Option<Ipv4Addr> {
        self.router.resolver().add_hostname(hostname, service_id)
    }

    pub fn remove_service(&self, service_id: &str) -> Vec<String> {
        self.router.resolver().remove_service(service_id)
    }

    pub fn counters(&self) -> FlowCounters {
        FlowCounters::new(self.router.stats(), self.context.interface.drops())
    }

    fn start_poll_loop(&self) {
        let router = Arc::clone(&self.router);
        let context = Arc::clone(&self.context);
        let callbacks = Arc::clone(&self.callbacks);
        let state = Arc::clone(&self.state);
        let wake = Arc::clone(&self.wake);
        let handle = self.runtime.spawn(async move {
            let mut ticker = time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                if !state.lock().running {
                    break;
                }
                // routing may run a blocking overlay write; keep it off the
                // runtime's async workers
                let router = Arc::clone(&router);
                let context = Arc::clone(&context);
                let callbacks = Arc::clone(&callbacks);
                let pass = tokio::task::spawn_blocking(move || {
                    poll_once(&router, &context.interface, callbacks.get())
                });
                if pass.await.is_err() {
                    break;
                }
            }
        });
        *self.poll_task.lock() = Some(handle);
    }
}

impl Drop for BridgeEngine {
    fn drop(&mut self) {
        self.router.shutdown();
    }
}

/// One pass of the poll loop: route every queued inbound frame, reclaim
/// finished flows and hand outbound packets to the host.
fn poll_once(router: &PacketRouter, interface: &InterfaceBridge, callbacks: Option<&BridgeCallbacks>) {
    loop {
        let frames = interface.drain_inbound(MAX_EMIT_BATCH);
        if frames.is_empty() {
            break;
        }
        for frame in frames {
            router.route(frame);
        }
    }
    router.prune();
    let Some(callbacks) = callbacks else { return };
    loop {
        let packets = interface.drain_outbound();
        if packets.is_empty() {
            break;
        }
        let (frames, families) = frames_with_families(packets);
        callbacks.emit(&frames, &families);
    }
}

/// Null when the configuration does not validate or the runtime cannot start.
#[no_mangle]
pub unsafe extern "C" fn BridgeNewEngine(config: *const BridgeConfig) -> *mut BridgeEngine {
    let config = match unsafe { config.as_ref() } {
        Some(cfg) => unsafe { cfg.to_tunnel_config() },
        None => Ok(TunnelConfig::default()),
    };
    let engine = config
        .map_err(|error| anyhow::Error::from(BridgeError::Config(error)))
        .and_then(BridgeEngine::new);
    match engine {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(_) => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeFreeEngine(engine: *mut BridgeEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe {
            drop(Box::from_raw(engine.as_ptr()));
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineStart(
    engine: *mut BridgeEngine,
    callbacks: *const BridgeCallbacks,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(callbacks) = (unsafe { callbacks.as_ref() }) else {
        return -2;
    };
    let engine = unsafe { engine.as_ref() };
    match engine.start(*callbacks) {
        Ok(_) => 0,
        Err(error) => {
            engine
                .logger()
                .error(format!("BridgeEngineStart error: {error:?}"));
            -3
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineStop(engine: *mut BridgeEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.stop();
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineSetLogSink(
    engine: *mut BridgeEngine,
    sink: *const BridgeLogSink,
    level: *const c_char,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let sink = unsafe { sink.as_ref() };
    let level = unsafe { read_c_str(level) };
    unsafe { engine.as_ref() }
        .logger()
        .install_sink(sink, level.as_deref())
        .is_ok()
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineSetBreadcrumbMask(engine: *mut BridgeEngine, mask: u32) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.logger().set_breadcrumb_mask(mask);
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineHandlePacket(
    engine: *mut BridgeEngine,
    packet: *const u8,
    length: usize,
    protocol: u32,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    if packet.is_null() || length == 0 {
        return false;
    }
    // Safety: caller guarantees `packet` points to `length` bytes of readable memory.
    let frame = unsafe { slice::from_raw_parts(packet, length) };
    unsafe { engine.as_ref() }.handle_packet(frame, protocol)
}

/// Bytes read from the overlay connection `handle`. A zero length marks end
/// of stream.
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineOnOverlayData(
    engine: *mut BridgeEngine,
    handle: u64,
    payload: *const u8,
    length: usize,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let data = if payload.is_null() || length == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(payload, length) }
    };
    unsafe { engine.as_ref() }.on_overlay_data(handle, data)
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineOnOverlayClose(engine: *mut BridgeEngine, handle: u64) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    unsafe { engine.as_ref() }.on_overlay_close(handle)
}

/// Registers `hostname` for `service_id` and writes its synthetic address to
/// `out_address` as four network-order bytes. Returns 0 on success, -3 when
/// the subnet has no free address.
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineAddHostname(
    engine: *mut BridgeEngine,
    hostname: *const c_char,
    service_id: *const c_char,
    out_address: *mut u8,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let hostname = unsafe { read_c_str(hostname) }.unwrap_or_default();
    let service_id = unsafe { read_c_str(service_id) }.unwrap_or_default();
    if hostname.is_empty() || service_id.is_empty() {
        return -2;
    }
    match unsafe { engine.as_ref() }.add_hostname(&hostname, &service_id) {
        Some(address) => {
            if !out_address.is_null() {
                let out = unsafe { slice::from_raw_parts_mut(out_address, 4) };
                out.copy_from_slice(&address.octets());
            }
            0
        }
        None => -3,
    }
}

/// Returns how many hostnames were released, or -1 on invalid arguments.
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineRemoveService(
    engine: *mut BridgeEngine,
    service_id: *const c_char,
) -> i64 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(service_id) = (unsafe { read_c_str(service_id) }) else {
        return -1;
    };
    unsafe { engine.as_ref() }.remove_service(&service_id).len() as i64
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineGetCounters(
    engine: *mut BridgeEngine,
    out: *mut FlowCounters,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    *out = unsafe { engine.as_ref() }.counters();
    true
}

#[no_mangle]
pub extern "C" fn BridgeEnsureLinked() -> bool {
    true
}
