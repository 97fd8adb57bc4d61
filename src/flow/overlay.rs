//! Contracts for the overlay network that intercepted TCP streams are carried
//! over. The engine never opens sockets itself; it asks an `OverlayDialer`
//! for a connection per flow and moves bytes through it.

use super::FlowKey;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Receives overlay bytes for a flow. `None` or an empty slice means the
/// remote side finished or failed.
pub type DataCallback = Box<dyn Fn(Option<&[u8]>) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OverlayError {
    #[error("overlay connection closed")]
    Closed,
    #[error("overlay write failed: {0}")]
    Write(String),
    #[error("overlay accepted {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

pub trait OverlayConnection: Send + Sync {
    /// Starts the connection and installs the data callback. Returns false
    /// when the service cannot be reached.
    fn connect(&self, on_data: DataCallback) -> bool;
    fn write(&self, data: &[u8]) -> Result<usize, OverlayError>;
    fn close(&self);
}

/// What the dialer knows about the destination of a new flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub key: FlowKey,
    /// Intercepted hostname owning the destination address, if any.
    pub hostname: Option<String>,
    pub service_ids: Vec<String>,
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hostname {
            Some(hostname) => write!(f, "{} ({hostname})", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

pub trait OverlayDialer: Send + Sync {
    fn open(&self, target: &DialTarget) -> Option<Arc<dyn OverlayConnection>>;
}
