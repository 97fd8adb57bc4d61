//! Crate-level failure taxonomy. Every variant degrades a single packet or a
//! single flow; none of them stops the engine.

use crate::config::ConfigError;
use crate::flow::OverlayError;
use crate::flow::FlowKey;
use crate::packet::{IpProtocol, ParseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] ParseError),
    #[error("unsupported protocol {0}")]
    UnsupportedProtocol(IpProtocol),
    #[error("overlay dial failed for {0}")]
    FlowDialFailure(FlowKey),
    #[error("protocol violation on {flow}: {detail}")]
    FlowProtocolViolation { flow: FlowKey, detail: String },
    #[error("synthetic address pool exhausted")]
    AddressExhaustion,
    #[error("peer window stayed closed on {0}")]
    FlowControlTimeout(FlowKey),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("overlay: {0}")]
    Overlay(#[from] OverlayError),
}
