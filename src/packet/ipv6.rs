use super::{read_u16, write_u16, IpHeader, IpProtocol, IpVersion, ParseError};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// Extension headers are not walked; the payload always starts here.
pub const HEADER_LEN: usize = 40;
pub const DEFAULT_HOP_LIMIT: u8 = 64;

mod field {
    pub const VER_TC_FLOW: usize = 0;
    pub const PAYLOAD_LEN: usize = 4;
    pub const NEXT_HEADER: usize = 6;
    pub const HOP_LIMIT: usize = 7;
    pub const SRC: usize = 8;
    pub const DST: usize = 24;
}

#[derive(Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    buffer: Vec<u8>,
}

impl Ipv6Packet {
    pub fn parse(mut buffer: Vec<u8>) -> Result<Self, ParseError> {
        let total_len = Self::declared_len(&buffer)?;
        buffer.truncate(total_len);
        Ok(Self { buffer })
    }

    /// Fixed header plus the declared payload length, once both fit.
    pub fn declared_len(buffer: &[u8]) -> Result<usize, ParseError> {
        let Some(&first) = buffer.first() else {
            return Err(ParseError::EmptyPacket);
        };
        if buffer.len() < HEADER_LEN {
            return Err(ParseError::MalformedIpv6Header);
        }
        if first >> 4 != 6 {
            return Err(ParseError::UnsupportedIpVersion(first >> 4));
        }
        let total_len = HEADER_LEN + read_u16(buffer, field::PAYLOAD_LEN) as usize;
        if total_len > buffer.len() {
            return Err(ParseError::MalformedIpv6Header);
        }
        Ok(total_len)
    }

    pub fn new(source: Ipv6Addr, destination: Ipv6Addr, protocol: IpProtocol) -> Self {
        let mut buffer = vec![0u8; HEADER_LEN];
        buffer[field::VER_TC_FLOW] = 0x60;
        buffer[field::NEXT_HEADER] = protocol.into();
        buffer[field::HOP_LIMIT] = DEFAULT_HOP_LIMIT;
        buffer[field::SRC..field::SRC + 16].copy_from_slice(&source.octets());
        buffer[field::DST..field::DST + 16].copy_from_slice(&destination.octets());
        Self { buffer }
    }

    pub fn reply_to(reference: &Ipv6Packet) -> Self {
        Self::new(
            reference.destination_v6(),
            reference.source_v6(),
            reference.protocol(),
        )
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn traffic_class(&self) -> u8 {
        let word = read_u16(&self.buffer, field::VER_TC_FLOW);
        ((word >> 4) & 0xFF) as u8
    }

    pub fn set_traffic_class(&mut self, value: u8) {
        let word = read_u16(&self.buffer, field::VER_TC_FLOW);
        let updated = (word & 0xF00F) | (u16::from(value) << 4);
        write_u16(&mut self.buffer, field::VER_TC_FLOW, updated);
    }

    pub fn flow_label(&self) -> u32 {
        let b = &self.buffer;
        (u32::from(b[1] & 0x0F) << 16) | (u32::from(b[2]) << 8) | u32::from(b[3])
    }

    pub fn set_flow_label(&mut self, label: u32) {
        self.buffer[1] = (self.buffer[1] & 0xF0) | ((label >> 16) as u8 & 0x0F);
        self.buffer[2] = (label >> 8) as u8;
        self.buffer[3] = label as u8;
    }

    pub fn payload_len(&self) -> u16 {
        read_u16(&self.buffer, field::PAYLOAD_LEN)
    }

    pub fn source_v6(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.buffer[field::SRC..field::SRC + 16]);
        Ipv6Addr::from(octets)
    }

    pub fn destination_v6(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.buffer[field::DST..field::DST + 16]);
        Ipv6Addr::from(octets)
    }

    pub fn set_source(&mut self, addr: Ipv6Addr) {
        self.buffer[field::SRC..field::SRC + 16].copy_from_slice(&addr.octets());
    }

    pub fn set_destination(&mut self, addr: Ipv6Addr) {
        self.buffer[field::DST..field::DST + 16].copy_from_slice(&addr.octets());
    }
}

impl IpHeader for Ipv6Packet {
    fn version(&self) -> IpVersion {
        IpVersion::V6
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn protocol(&self) -> IpProtocol {
        IpProtocol::from(self.buffer[field::NEXT_HEADER])
    }

    fn set_protocol(&mut self, protocol: IpProtocol) {
        self.buffer[field::NEXT_HEADER] = protocol.into();
    }

    fn hop_limit(&self) -> u8 {
        self.buffer[field::HOP_LIMIT]
    }

    fn set_hop_limit(&mut self, value: u8) {
        self.buffer[field::HOP_LIMIT] = value;
    }

    fn source(&self) -> IpAddr {
        IpAddr::V6(self.source_v6())
    }

    fn destination(&self) -> IpAddr {
        IpAddr::V6(self.destination_v6())
    }

    fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_LEN..]
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[HEADER_LEN..]
    }

    fn set_payload(&mut self, payload: &[u8]) {
        self.buffer.truncate(HEADER_LEN);
        self.buffer.extend_from_slice(payload);
        self.update_lengths_and_checksums();
    }

    fn update_lengths_and_checksums(&mut self) {
        let len = (self.buffer.len() - HEADER_LEN).min(u16::MAX as usize) as u16;
        write_u16(&mut self.buffer, field::PAYLOAD_LEN, len);
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl fmt::Display for Ipv6Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPv6 {} -> {} next={} hop={} len={}",
            self.source_v6(),
            self.destination_v6(),
            self.protocol(),
            self.hop_limit(),
            self.buffer.len()
        )
    }
}

impl fmt::Debug for Ipv6Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
