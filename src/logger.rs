use crate::ffi::BridgeLogSink;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

type LogCallback = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

/// In-process sink, used by embedders written in Rust and by tests.
pub type NativeSink = Arc<dyn Fn(LogLevel, BreadcrumbFlags, &str) + Send + Sync>;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const DEVICE = 0b0000_0001;
        const FLOW   = 0b0000_0010;
        const DNS    = 0b0000_0100;
        const ROUTER = 0b0000_1000;
        const FFI    = 0b0001_0000;
        const POLL   = 0b0010_0000;
        const PACKET = 0b0100_0000;
        const ALL    = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    /// Unknown names fall back to `Info`.
    fn parse(value: &str) -> Self {
        let value = value.trim();
        [LogLevel::Error, LogLevel::Warn, LogLevel::Debug]
            .into_iter()
            .find(|level| {
                value.eq_ignore_ascii_case(level.as_str())
                    || level.aliases().iter().any(|alias| value.eq_ignore_ascii_case(alias))
            })
            .unwrap_or(LogLevel::Info)
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            LogLevel::Error => &["err"],
            LogLevel::Warn => &["warning"],
            LogLevel::Info => &[],
            LogLevel::Debug => &["dbg", "trace"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone)]
enum SinkTarget {
    Foreign {
        callback: LogCallback,
        context: *mut c_void,
    },
    Native(NativeSink),
}

#[derive(Clone)]
struct LogSinkInner {
    target: SinkTarget,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

unsafe impl Send for LogSinkInner {}
unsafe impl Sync for LogSinkInner {}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
    prefix: String,
    rate_limiter: RateLimitedLogger,
}

/// Cheap-to-clone logging handle owned by the engine context.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LogManager>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub fn new() -> Self {
        let pid = std::process::id();
        Self {
            inner: Arc::new(LogManager {
                sink: Mutex::new(None),
                prefix: format!("[ib-p{pid}]"),
                rate_limiter: RateLimitedLogger::new(),
            }),
        }
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.inner.log(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.inner.log(LogLevel::Error, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.inner.log(LogLevel::Info, message.into());
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.inner.log(LogLevel::Debug, message.into());
    }

    pub fn breadcrumb(&self, flag: BreadcrumbFlags, message: impl Into<String>) {
        self.inner.breadcrumb(flag, message.into());
    }

    /// Breadcrumb whose message is only formatted when the category is on.
    pub fn breadcrumb_with(&self, flag: BreadcrumbFlags, message: impl FnOnce() -> String) {
        if self.inner.breadcrumb_enabled(flag) {
            self.inner.breadcrumb(flag, message());
        }
    }

    pub fn install_sink(
        &self,
        sink: Option<&BridgeLogSink>,
        level: Option<&str>,
    ) -> Result<(), &'static str> {
        let inner = match sink {
            Some(sink) => {
                let callback = match sink.log {
                    Some(cb) => cb,
                    None => return Err("log callback missing"),
                };
                Some(LogSinkInner {
                    target: SinkTarget::Foreign {
                        callback,
                        context: sink.context,
                    },
                    breadcrumbs: BreadcrumbFlags::from_bits_truncate(sink.enabled_breadcrumbs),
                    min_level: level.map(LogLevel::parse).unwrap_or(LogLevel::Info),
                })
            }
            None => None,
        };
        *self.inner.sink.lock() = inner;
        Ok(())
    }

    pub fn install_native_sink(
        &self,
        sink: NativeSink,
        min_level: LogLevel,
        breadcrumbs: BreadcrumbFlags,
    ) {
        *self.inner.sink.lock() = Some(LogSinkInner {
            target: SinkTarget::Native(sink),
            breadcrumbs,
            min_level,
        });
    }

    pub fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.inner.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    /// Log an error with rate limiting to prevent log flooding.
    /// Only one log per category per second will be emitted.
    /// Returns true if the log was emitted, false if suppressed.
    pub fn rate_limited_error(&self, category: ErrorCategory, message: impl Into<String>) -> bool {
        if !self.inner.rate_limiter.admit(category) {
            return false;
        }
        self.warn(format!("[{}] {}", category.label(), message.into()));
        true
    }
}

impl LogManager {
    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn breadcrumb_enabled(&self, flag: BreadcrumbFlags) -> bool {
        self.sink
            .lock()
            .as_ref()
            .map(|inner| inner.breadcrumbs.intersects(flag))
            .unwrap_or(false)
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let sink = self.sink.lock().clone();
        let Some(inner) = sink else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if breadcrumbs.is_empty() {
            format!("{} {message}", self.prefix)
        } else {
            format!("{} [{}] {message}", self.prefix, label_for(breadcrumbs))
        };

        match inner.target {
            SinkTarget::Native(sink) => sink(level, breadcrumbs, &formatted),
            SinkTarget::Foreign { callback, context } => {
                let (Ok(level), Ok(line)) = (CString::new(level.as_str()), CString::new(formatted))
                else {
                    return;
                };
                // SAFETY: the host guarantees the callback and context stay valid
                // while the sink is installed.
                unsafe {
                    callback(level.as_ptr(), line.as_ptr(), breadcrumbs.bits(), context);
                }
            }
        }
    }
}

/// Label of the first category present, in priority order.
const LABELS: [(BreadcrumbFlags, &str); 7] = [
    (BreadcrumbFlags::FLOW, "FLOW"),
    (BreadcrumbFlags::DNS, "DNS"),
    (BreadcrumbFlags::ROUTER, "ROUTER"),
    (BreadcrumbFlags::DEVICE, "DEVICE"),
    (BreadcrumbFlags::FFI, "FFI"),
    (BreadcrumbFlags::POLL, "POLL"),
    (BreadcrumbFlags::PACKET, "PACKET"),
];

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    LABELS
        .iter()
        .find(|(flag, _)| flags.contains(*flag))
        .map_or("LOG", |(_, label)| label)
}

// ============================================================================
// Rate-Limited Error Logging
// ============================================================================
// Each error category has its own limiter so a flood in one category never
// hides a first occurrence in another.

/// Minimum interval between logs of the same error category (in milliseconds).
const RATE_LIMIT_INTERVAL_MS: u64 = 1000;
const CATEGORY_COUNT: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid IP packet structure (version, header length, etc.)
    PacketInvalidIp,
    PacketInvalidTcp,
    PacketInvalidUdp,
    /// Synthetic address pool exhausted
    AddressExhausted,
    /// Peer window stayed closed past the flow-control timeout
    FlowControl,
    /// FFI/callback errors
    CallbackError,
    /// Overlay connection write or dial failures
    OverlayError,
}

impl ErrorCategory {
    fn index(self) -> usize {
        match self {
            Self::PacketInvalidIp => 0,
            Self::PacketInvalidTcp => 1,
            Self::PacketInvalidUdp => 2,
            Self::AddressExhausted => 3,
            Self::FlowControl => 4,
            Self::CallbackError => 5,
            Self::OverlayError => 6,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::PacketInvalidIp => "INVALID_IP",
            Self::PacketInvalidTcp => "INVALID_TCP",
            Self::PacketInvalidUdp => "INVALID_UDP",
            Self::AddressExhausted => "ADDRESS_EXHAUSTED",
            Self::FlowControl => "FLOW_CONTROL",
            Self::CallbackError => "CALLBACK_ERROR",
            Self::OverlayError => "OVERLAY_ERROR",
        }
    }
}

/// Atomic timestamps for lock-free rate limiting.
struct RateLimitedLogger {
    /// Last log time (unix millis) for each error category.
    last_log_times: [AtomicU64; CATEGORY_COUNT],
}

impl RateLimitedLogger {
    fn new() -> Self {
        Self {
            last_log_times: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn admit(&self, category: ErrorCategory) -> bool {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let idx = category.index();
        let last = self.last_log_times[idx].load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < RATE_LIMIT_INTERVAL_MS {
            return false;
        }
        // Another thread may have logged in between; only the CAS winner emits.
        self.last_log_times[idx]
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
