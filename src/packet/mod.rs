//! Wire codecs for the IP, UDP and TCP headers handled by the engine.
//!
//! Every packet type owns its byte buffer. Header fields are read and written
//! through fixed offsets into that buffer, so a packet can be parsed from a
//! frame, mutated in place and handed back to the interface without copying
//! into intermediate structs.

pub mod checksum;
mod ipv4;
mod ipv6;
pub mod tcp;
pub mod udp;

pub use ipv4::Ipv4Packet;
pub use ipv6::Ipv6Packet;
pub use smoltcp::wire::IpProtocol;
pub use tcp::{TcpFlags, TcpOption, TcpOptions, TcpPacket};
pub use udp::UdpPacket;

use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Detailed error information for packet parsing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty packet")]
    EmptyPacket,
    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),
    /// Too short, bad header length or total length past the buffer.
    #[error("malformed IPv4 header")]
    MalformedIpv4Header,
    /// Too short or payload length past the buffer.
    #[error("malformed IPv6 header")]
    MalformedIpv6Header,
    #[error("malformed TCP segment")]
    MalformedTcpSegment,
    #[error("malformed UDP datagram")]
    MalformedUdpDatagram,
    /// The IP payload carries a different transport than requested.
    #[error("unexpected transport protocol {0}")]
    UnexpectedProtocol(IpProtocol),
    /// Source and destination belong to different address families.
    #[error("mixed address families")]
    MixedAddressFamilies,
}

impl ParseError {
    /// Returns true if this is an IP-layer error (for counter classification).
    pub fn is_ip_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyPacket
                | Self::UnsupportedIpVersion(_)
                | Self::MalformedIpv4Header
                | Self::MalformedIpv6Header
                | Self::MixedAddressFamilies
        )
    }

    pub fn is_tcp_error(&self) -> bool {
        matches!(self, Self::MalformedTcpSegment)
    }

    pub fn is_udp_error(&self) -> bool {
        matches!(self, Self::MalformedUdpDatagram)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Address family constant the host interface expects next to a frame.
    pub fn address_family(self) -> u32 {
        match self {
            IpVersion::V4 => libc::AF_INET as u32,
            IpVersion::V6 => libc::AF_INET6 as u32,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => f.write_str("IPv4"),
            IpVersion::V6 => f.write_str("IPv6"),
        }
    }
}

/// Operations shared by both IP versions.
pub trait IpHeader {
    fn version(&self) -> IpVersion;
    fn header_len(&self) -> usize;
    fn protocol(&self) -> IpProtocol;
    fn set_protocol(&mut self, protocol: IpProtocol);
    /// TTL for IPv4, hop limit for IPv6.
    fn hop_limit(&self) -> u8;
    fn set_hop_limit(&mut self, value: u8);
    fn source(&self) -> IpAddr;
    fn destination(&self) -> IpAddr;
    fn payload(&self) -> &[u8];
    fn payload_mut(&mut self) -> &mut [u8];
    /// Replaces everything after the header and rewrites the length field.
    fn set_payload(&mut self, payload: &[u8]);
    /// Rewrites the length field from the buffer length and, for IPv4,
    /// recomputes the header checksum.
    fn update_lengths_and_checksums(&mut self);
    fn as_bytes(&self) -> &[u8];
}

/// An owned IP packet of either version.
#[derive(Clone, PartialEq, Eq)]
pub enum IpPacket {
    V4(Ipv4Packet),
    V6(Ipv6Packet),
}

impl IpPacket {
    /// Parses a frame by its leading version nibble.
    pub fn parse(buffer: Vec<u8>) -> Result<Self, ParseError> {
        let Some(first) = buffer.first() else {
            return Err(ParseError::EmptyPacket);
        };
        match first >> 4 {
            4 => Ipv4Packet::parse(buffer).map(IpPacket::V4),
            6 => Ipv6Packet::parse(buffer).map(IpPacket::V6),
            version => Err(ParseError::UnsupportedIpVersion(version)),
        }
    }

    /// Validates the IP header of a borrowed frame, as `parse` would.
    pub fn check(frame: &[u8]) -> Result<IpVersion, ParseError> {
        match frame.first().map(|first| first >> 4) {
            None => Err(ParseError::EmptyPacket),
            Some(4) => Ipv4Packet::declared_len(frame).map(|_| IpVersion::V4),
            Some(6) => Ipv6Packet::declared_len(frame).map(|_| IpVersion::V6),
            Some(version) => Err(ParseError::UnsupportedIpVersion(version)),
        }
    }

    /// Builds an empty packet (header only) for the given endpoints.
    pub fn new(
        source: IpAddr,
        destination: IpAddr,
        protocol: IpProtocol,
        identification: u16,
    ) -> Result<Self, ParseError> {
        match (source, destination) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Ok(IpPacket::V4(Ipv4Packet::new(
                src,
                dst,
                protocol,
                identification,
            ))),
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                Ok(IpPacket::V6(Ipv6Packet::new(src, dst, protocol)))
            }
            _ => Err(ParseError::MixedAddressFamilies),
        }
    }

    /// Reply skeleton for `reference`: same protocol, swapped addresses,
    /// default TTL/flags and the supplied identification.
    pub fn reply_to(reference: &IpPacket, identification: u16) -> Self {
        match reference {
            IpPacket::V4(packet) => IpPacket::V4(Ipv4Packet::reply_to(packet, identification)),
            IpPacket::V6(packet) => IpPacket::V6(Ipv6Packet::reply_to(packet)),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            IpPacket::V4(packet) => packet.into_bytes(),
            IpPacket::V6(packet) => packet.into_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl IpHeader for IpPacket {
    fn version(&self) -> IpVersion {
        match self {
            IpPacket::V4(p) => p.version(),
            IpPacket::V6(p) => p.version(),
        }
    }

    fn header_len(&self) -> usize {
        match self {
            IpPacket::V4(p) => p.header_len(),
            IpPacket::V6(p) => p.header_len(),
        }
    }

    fn protocol(&self) -> IpProtocol {
        match self {
            IpPacket::V4(p) => p.protocol(),
            IpPacket::V6(p) => p.protocol(),
        }
    }

    fn set_protocol(&mut self, protocol: IpProtocol) {
        match self {
            IpPacket::V4(p) => p.set_protocol(protocol),
            IpPacket::V6(p) => p.set_protocol(protocol),
        }
    }

    fn hop_limit(&self) -> u8 {
        match self {
            IpPacket::V4(p) => p.hop_limit(),
            IpPacket::V6(p) => p.hop_limit(),
        }
    }

    fn set_hop_limit(&mut self, value: u8) {
        match self {
            IpPacket::V4(p) => p.set_hop_limit(value),
            IpPacket::V6(p) => p.set_hop_limit(value),
        }
    }

    fn source(&self) -> IpAddr {
        match self {
            IpPacket::V4(p) => p.source(),
            IpPacket::V6(p) => p.source(),
        }
    }

    fn destination(&self) -> IpAddr {
        match self {
            IpPacket::V4(p) => p.destination(),
            IpPacket::V6(p) => p.destination(),
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            IpPacket::V4(p) => p.payload(),
            IpPacket::V6(p) => p.payload(),
        }
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        match self {
            IpPacket::V4(p) => p.payload_mut(),
            IpPacket::V6(p) => p.payload_mut(),
        }
    }

    fn set_payload(&mut self, payload: &[u8]) {
        match self {
            IpPacket::V4(p) => p.set_payload(payload),
            IpPacket::V6(p) => p.set_payload(payload),
        }
    }

    fn update_lengths_and_checksums(&mut self) {
        match self {
            IpPacket::V4(p) => p.update_lengths_and_checksums(),
            IpPacket::V6(p) => p.update_lengths_and_checksums(),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            IpPacket::V4(p) => p.as_bytes(),
            IpPacket::V6(p) => p.as_bytes(),
        }
    }
}

impl fmt::Display for IpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpPacket::V4(p) => fmt::Display::fmt(p, f),
            IpPacket::V6(p) => fmt::Display::fmt(p, f),
        }
    }
}

impl fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
