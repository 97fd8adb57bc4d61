//! C ABI types shared with the host application, plus the overlay dialer that
//! forwards connection traffic through the host's callbacks.

use crate::config::{ConfigError, TunnelConfig, DNS_KEY, DNS_PROXIES_KEY, FALLBACK_KEY};
use crate::config::{FLOW_CONTROL_POLICY_KEY, FLOW_CONTROL_TIMEOUT_KEY, IP_KEY, MATCH_DOMAINS_KEY};
use crate::config::{MTU_KEY, RING_CAPACITY_KEY, SUBNET_KEY};
use crate::device::BridgeDrops;
use crate::flow::{DataCallback, DialTarget, OverlayConnection, OverlayDialer, OverlayError};
use crate::logger::{BreadcrumbFlags, Logger};
use crate::router::RouterStats;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub type EmitPacketsFn = unsafe extern "C" fn(
    packets: *const *const u8,
    sizes: *const usize,
    protocols: *const u32,
    count: usize,
    context: *mut c_void,
);
/// Opens the overlay connection for `handle`. `service_ids` is a comma
/// separated list, `host` may be null when the address has no hostname.
pub type OverlayConnectFn = unsafe extern "C" fn(
    handle: u64,
    host: *const c_char,
    port: u16,
    service_ids: *const c_char,
    context: *mut c_void,
) -> bool;
/// Returns the number of bytes accepted, or a negative value on failure.
pub type OverlayWriteFn =
    unsafe extern "C" fn(handle: u64, payload: *const u8, length: usize, context: *mut c_void) -> isize;
pub type OverlayCloseFn = unsafe extern "C" fn(handle: u64, context: *mut c_void);

/// Mirror of the `BridgeConfig` struct in `include/bridge.h`. Null strings
/// and zero numbers keep the defaults; list fields are comma separated.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BridgeConfig {
    pub ip: *const c_char,
    pub subnet_mask: *const c_char,
    pub mtu: u32,
    pub dns_addresses: *const c_char,
    pub match_domains: *const c_char,
    pub dns_proxies: *const c_char,
    pub flow_control_timeout_ms: u32,
    /// Reset flows whose peer window stays closed instead of sending anyway.
    pub flow_control_drop: bool,
    pub ring_capacity: u32,
    /// Resolve names outside the match domains through `dns_proxies`
    /// instead of the system resolver.
    pub upstream_fallback: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ip: std::ptr::null(),
            subnet_mask: std::ptr::null(),
            mtu: 0,
            dns_addresses: std::ptr::null(),
            match_domains: std::ptr::null(),
            dns_proxies: std::ptr::null(),
            flow_control_timeout_ms: 0,
            flow_control_drop: false,
            ring_capacity: 0,
            upstream_fallback: false,
        }
    }
}

impl BridgeConfig {
    /// Converts to a validated [`TunnelConfig`].
    ///
    /// # Safety
    /// Every non-null string field must point to a NUL-terminated string that
    /// stays valid for the duration of the call.
    pub unsafe fn to_tunnel_config(&self) -> Result<TunnelConfig, ConfigError> {
        let mut values = HashMap::new();
        let strings = [
            (IP_KEY, self.ip),
            (SUBNET_KEY, self.subnet_mask),
            (DNS_KEY, self.dns_addresses),
            (MATCH_DOMAINS_KEY, self.match_domains),
            (DNS_PROXIES_KEY, self.dns_proxies),
        ];
        for (key, pointer) in strings {
            if let Some(value) = unsafe { read_c_str(pointer) } {
                values.insert(key.to_string(), value);
            }
        }
        let numbers = [
            (MTU_KEY, self.mtu),
            (FLOW_CONTROL_TIMEOUT_KEY, self.flow_control_timeout_ms),
            (RING_CAPACITY_KEY, self.ring_capacity),
        ];
        for (key, value) in numbers {
            if value != 0 {
                values.insert(key.to_string(), value.to_string());
            }
        }
        if self.flow_control_drop {
            values.insert(FLOW_CONTROL_POLICY_KEY.to_string(), "drop".to_string());
        }
        if self.upstream_fallback {
            values.insert(FALLBACK_KEY.to_string(), "upstream".to_string());
        }
        TunnelConfig::from_dictionary(&values)
    }
}

/// Reads a C string, treating null as absent.
///
/// # Safety
/// `pointer` must be null or point to a NUL-terminated string.
pub(crate) unsafe fn read_c_str(pointer: *const c_char) -> Option<String> {
    if pointer.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(pointer) }
        .to_str()
        .ok()
        .map(str::to_string)
}

/// Callbacks installed by the host so the engine can emit frames and drive
/// overlay connections.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeCallbacks {
    pub emit_packets: EmitPacketsFn,
    pub overlay_connect: OverlayConnectFn,
    pub overlay_write: OverlayWriteFn,
    pub overlay_close: OverlayCloseFn,
    pub context: *mut c_void,
}

unsafe impl Send for BridgeCallbacks {}
unsafe impl Sync for BridgeCallbacks {}

impl BridgeCallbacks {
    /// Hands a batch of frames to the host. `families` runs parallel to
    /// `frames`.
    pub fn emit(&self, frames: &[Vec<u8>], families: &[u32]) {
        if frames.is_empty() {
            return;
        }
        let pointers: Vec<*const u8> = frames.iter().map(|frame| frame.as_ptr()).collect();
        let sizes: Vec<usize> = frames.iter().map(Vec::len).collect();
        // Safety: the arrays outlive the call and hold `frames.len()` entries.
        unsafe {
            (self.emit_packets)(
                pointers.as_ptr(),
                sizes.as_ptr(),
                families.as_ptr(),
                frames.len(),
                self.context,
            );
        }
    }
}

#[repr(C)]
pub struct BridgeLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowCounters {
    /// Frames whose IP header did not parse.
    pub invalid_ip_packets: u64,
    /// TCP segments that were truncated or had a bad data offset.
    pub invalid_tcp_packets: u64,
    pub invalid_udp_packets: u64,
    pub dropped_packets: u64,
    pub flows_admitted: u64,
    pub flows_closed: u64,
    pub active_flows: u64,
    pub dns_answered: u64,
    pub dns_fallbacks: u64,
    pub inbound_rejected: u64,
    pub inbound_evicted: u64,
    pub outbound_evicted: u64,
}

impl FlowCounters {
    pub fn new(stats: RouterStats, drops: BridgeDrops) -> Self {
        Self {
            invalid_ip_packets: stats.invalid_ip_packets,
            invalid_tcp_packets: stats.invalid_tcp_packets,
            invalid_udp_packets: stats.invalid_udp_packets,
            dropped_packets: stats.dropped_packets,
            flows_admitted: stats.flows_admitted,
            flows_closed: stats.flows_closed,
            active_flows: stats.active_flows,
            dns_answered: stats.dns_answered,
            dns_fallbacks: stats.dns_fallbacks,
            inbound_rejected: drops.inbound_rejected,
            inbound_evicted: drops.inbound_evicted,
            outbound_evicted: drops.outbound_evicted,
        }
    }
}

/// Data callbacks of the open overlay connections, keyed by the handle the
/// host sees.
#[derive(Default)]
pub struct OverlayRegistry {
    connections: Mutex<FxHashMap<u64, DataCallback>>,
    next_handle: AtomicU64,
}

impl OverlayRegistry {
    fn allocate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn register(&self, handle: u64, on_data: DataCallback) {
        self.connections.lock().insert(handle, on_data);
    }

    fn remove(&self, handle: u64) -> bool {
        self.connections.lock().remove(&handle).is_some()
    }

    /// Passes bytes from the host to the flow owning `handle`. An empty
    /// slice is end of stream. Returns `false` for unknown handles.
    pub fn deliver(&self, handle: u64, data: &[u8]) -> bool {
        let connections = self.connections.lock();
        match connections.get(&handle) {
            Some(on_data) => {
                on_data((!data.is_empty()).then_some(data));
                true
            }
            None => false,
        }
    }

    /// The host closed `handle`: signal end of stream once and forget it.
    pub fn close(&self, handle: u64) -> bool {
        let on_data = self.connections.lock().remove(&handle);
        match on_data {
            Some(on_data) => {
                on_data(None);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dials overlay connections through the host callbacks. Until the callbacks
/// are installed every dial fails.
pub struct CallbackDialer {
    callbacks: Arc<OnceCell<BridgeCallbacks>>,
    registry: Arc<OverlayRegistry>,
    logger: Logger,
}

impl CallbackDialer {
    pub fn new(
        callbacks: Arc<OnceCell<BridgeCallbacks>>,
        registry: Arc<OverlayRegistry>,
        logger: Logger,
    ) -> Self {
        Self {
            callbacks,
            registry,
            logger,
        }
    }
}

impl OverlayDialer for CallbackDialer {
    fn open(&self, target: &DialTarget) -> Option<Arc<dyn OverlayConnection>> {
        let callbacks = *self.callbacks.get()?;
        let handle = self.registry.allocate();
        self.logger
            .breadcrumb_with(BreadcrumbFlags::FFI, || format!("overlay #{handle} for {target}"));
        Some(Arc::new(CallbackOverlay {
            handle,
            target: target.clone(),
            callbacks,
            registry: Arc::clone(&self.registry),
            closed: AtomicBool::new(false),
        }))
    }
}

struct CallbackOverlay {
    handle: u64,
    target: DialTarget,
    callbacks: BridgeCallbacks,
    registry: Arc<OverlayRegistry>,
    closed: AtomicBool,
}

impl OverlayConnection for CallbackOverlay {
    fn connect(&self, on_data: DataCallback) -> bool {
        // registered first: the host may deliver data before returning
        self.registry.register(self.handle, on_data);
        let host = self
            .target
            .hostname
            .as_deref()
            .and_then(|name| CString::new(name).ok());
        let services = CString::new(self.target.service_ids.join(",")).unwrap_or_default();
        let connected = unsafe {
            (self.callbacks.overlay_connect)(
                self.handle,
                host.as_ref().map_or(std::ptr::null(), |name| name.as_ptr()),
                self.target.key.destination.port(),
                services.as_ptr(),
                self.callbacks.context,
            )
        };
        if !connected {
            self.registry.remove(self.handle);
            self.closed.store(true, Ordering::SeqCst);
        }
        connected
    }

    fn write(&self, data: &[u8]) -> Result<usize, OverlayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        let written = unsafe {
            (self.callbacks.overlay_write)(
                self.handle,
                data.as_ptr(),
                data.len(),
                self.callbacks.context,
            )
        };
        usize::try_from(written)
            .map_err(|_| OverlayError::Write(format!("host rejected write on #{}", self.handle)))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.remove(self.handle);
        unsafe { (self.callbacks.overlay_close)(self.handle, self.callbacks.context) };
    }
}
