//! Intercepted transport flows: identification, the overlay they ride on,
//! and the server-side TCP endpoint that terminates them.

mod connection;
mod overlay;
mod regulator;

pub use connection::{SegmentOutcome, TcpFlow, TIME_WAIT_LINGER};
pub use overlay::{DataCallback, DialTarget, OverlayConnection, OverlayDialer, OverlayError};
pub use regulator::{Admission, TransferRegulator};

use crate::packet::IpProtocol;
use std::fmt;
use std::net::SocketAddr;

/// Identifies a flow by protocol and the client's view of its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: IpProtocol,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl FlowKey {
    pub fn tcp(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            protocol: IpProtocol::Tcp,
            source,
            destination,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.protocol {
            IpProtocol::Tcp => "TCP",
            IpProtocol::Udp => "UDP",
            _ => "IP",
        };
        write!(f, "{protocol}:{}->{}", self.source, self.destination)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Listen,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    Closed,
}

impl TcpState {
    pub fn as_str(self) -> &'static str {
        match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynReceived => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests;
