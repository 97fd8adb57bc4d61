use super::{checksum, read_u16, write_u16, IpHeader, IpProtocol, IpVersion, ParseError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

pub const MIN_HEADER_LEN: usize = 20;
pub const DEFAULT_TTL: u8 = 64;
pub const FLAG_DONT_FRAGMENT: u8 = 0b010;
pub const FLAG_MORE_FRAGMENTS: u8 = 0b001;

mod field {
    pub const VER_IHL: usize = 0;
    pub const DSCP_ECN: usize = 1;
    pub const LENGTH: usize = 2;
    pub const IDENT: usize = 4;
    pub const FLAGS_FRAG: usize = 6;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: usize = 10;
    pub const SRC: usize = 12;
    pub const DST: usize = 16;
}

#[derive(Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    buffer: Vec<u8>,
}

impl Ipv4Packet {
    /// Checks the header of a raw frame without taking ownership and returns
    /// the declared total length.
    pub fn declared_len(buffer: &[u8]) -> Result<usize, ParseError> {
        let Some(&first) = buffer.first() else {
            return Err(ParseError::EmptyPacket);
        };
        if buffer.len() < MIN_HEADER_LEN {
            return Err(ParseError::MalformedIpv4Header);
        }
        if first >> 4 != 4 {
            return Err(ParseError::UnsupportedIpVersion(first >> 4));
        }
        let header_len = usize::from(first & 0x0F) * 4;
        if header_len < MIN_HEADER_LEN || header_len > buffer.len() {
            return Err(ParseError::MalformedIpv4Header);
        }
        let total_len = read_u16(buffer, field::LENGTH) as usize;
        if total_len < header_len || total_len > buffer.len() {
            return Err(ParseError::MalformedIpv4Header);
        }
        Ok(total_len)
    }

    /// Validates the header and trims the buffer to the declared total length.
    pub fn parse(mut buffer: Vec<u8>) -> Result<Self, ParseError> {
        let total_len = Self::declared_len(&buffer)?;
        buffer.truncate(total_len);
        Ok(Self { buffer })
    }

    /// Header-only packet with default TTL and the don't-fragment flag.
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr, protocol: IpProtocol, identification: u16) -> Self {
        let mut buffer = vec![0u8; MIN_HEADER_LEN];
        buffer[field::VER_IHL] = 0x45;
        buffer[field::TTL] = DEFAULT_TTL;
        buffer[field::PROTOCOL] = protocol.into();
        buffer[field::SRC..field::SRC + 4].copy_from_slice(&source.octets());
        buffer[field::DST..field::DST + 4].copy_from_slice(&destination.octets());
        let mut packet = Self { buffer };
        packet.set_identification(identification);
        packet.set_flags(FLAG_DONT_FRAGMENT);
        packet.update_lengths_and_checksums();
        packet
    }

    pub fn reply_to(reference: &Ipv4Packet, identification: u16) -> Self {
        Self::new(
            reference.destination_v4(),
            reference.source_v4(),
            reference.protocol(),
            identification,
        )
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn dscp_ecn(&self) -> u8 {
        self.buffer[field::DSCP_ECN]
    }

    pub fn total_len(&self) -> u16 {
        read_u16(&self.buffer, field::LENGTH)
    }

    pub fn identification(&self) -> u16 {
        read_u16(&self.buffer, field::IDENT)
    }

    pub fn set_identification(&mut self, value: u16) {
        write_u16(&mut self.buffer, field::IDENT, value);
    }

    /// The three flag bits (reserved, DF, MF).
    pub fn flags(&self) -> u8 {
        self.buffer[field::FLAGS_FRAG] >> 5
    }

    pub fn set_flags(&mut self, flags: u8) {
        let byte = &mut self.buffer[field::FLAGS_FRAG];
        *byte = (*byte & 0x1F) | ((flags & 0x07) << 5);
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags() & FLAG_DONT_FRAGMENT != 0
    }

    pub fn more_fragments(&self) -> bool {
        self.flags() & FLAG_MORE_FRAGMENTS != 0
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        read_u16(&self.buffer, field::FLAGS_FRAG) & 0x1FFF
    }

    pub fn set_fragment_offset(&mut self, offset: u16) {
        let current = read_u16(&self.buffer, field::FLAGS_FRAG);
        write_u16(
            &mut self.buffer,
            field::FLAGS_FRAG,
            (current & 0xE000) | (offset & 0x1FFF),
        );
    }

    pub fn header_checksum(&self) -> u16 {
        read_u16(&self.buffer, field::CHECKSUM)
    }

    pub fn compute_header_checksum(&self) -> u16 {
        checksum::ipv4_header(&self.buffer[..self.header_len()])
    }

    pub fn verify_checksum(&self) -> bool {
        self.header_checksum() == self.compute_header_checksum()
    }

    pub fn source_v4(&self) -> Ipv4Addr {
        let b = &self.buffer[field::SRC..field::SRC + 4];
        Ipv4Addr::new(b[0], b[1], b[2], b[3])
    }

    pub fn destination_v4(&self) -> Ipv4Addr {
        let b = &self.buffer[field::DST..field::DST + 4];
        Ipv4Addr::new(b[0], b[1], b[2], b[3])
    }

    pub fn set_source(&mut self, addr: Ipv4Addr) {
        self.buffer[field::SRC..field::SRC + 4].copy_from_slice(&addr.octets());
    }

    pub fn set_destination(&mut self, addr: Ipv4Addr) {
        self.buffer[field::DST..field::DST + 4].copy_from_slice(&addr.octets());
    }
}

impl IpHeader for Ipv4Packet {
    fn version(&self) -> IpVersion {
        IpVersion::V4
    }

    fn header_len(&self) -> usize {
        usize::from(self.buffer[field::VER_IHL] & 0x0F) * 4
    }

    fn protocol(&self) -> IpProtocol {
        IpProtocol::from(self.buffer[field::PROTOCOL])
    }

    fn set_protocol(&mut self, protocol: IpProtocol) {
        self.buffer[field::PROTOCOL] = protocol.into();
    }

    fn hop_limit(&self) -> u8 {
        self.buffer[field::TTL]
    }

    fn set_hop_limit(&mut self, value: u8) {
        self.buffer[field::TTL] = value;
    }

    fn source(&self) -> IpAddr {
        IpAddr::V4(self.source_v4())
    }

    fn destination(&self) -> IpAddr {
        IpAddr::V4(self.destination_v4())
    }

    fn payload(&self) -> &[u8] {
        &self.buffer[self.header_len()..]
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.header_len();
        &mut self.buffer[start..]
    }

    fn set_payload(&mut self, payload: &[u8]) {
        let header_len = self.header_len();
        self.buffer.truncate(header_len);
        self.buffer.extend_from_slice(payload);
        let total = self.buffer.len().min(u16::MAX as usize) as u16;
        write_u16(&mut self.buffer, field::LENGTH, total);
    }

    fn update_lengths_and_checksums(&mut self) {
        let total = self.buffer.len().min(u16::MAX as usize) as u16;
        write_u16(&mut self.buffer, field::LENGTH, total);
        let sum = self.compute_header_checksum();
        write_u16(&mut self.buffer, field::CHECKSUM, sum);
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl fmt::Display for Ipv4Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPv4 {} -> {} proto={} ttl={} id={} len={}",
            self.source_v4(),
            self.destination_v4(),
            self.protocol(),
            self.hop_limit(),
            self.identification(),
            self.buffer.len()
        )
    }
}

impl fmt::Debug for Ipv4Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
