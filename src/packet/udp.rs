//! UDP datagram view over an owned IP packet.

use super::{checksum, read_u16, write_u16, IpHeader, IpPacket, IpProtocol, ParseError};
use std::fmt;

pub const HEADER_LEN: usize = 8;

mod field {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const LENGTH: usize = 4;
    pub const CHECKSUM: usize = 6;
}

#[derive(Clone, PartialEq, Eq)]
pub struct UdpPacket {
    ip: IpPacket,
}

impl UdpPacket {
    pub fn parse(ip: IpPacket) -> Result<Self, ParseError> {
        if ip.protocol() != IpProtocol::Udp {
            return Err(ParseError::UnexpectedProtocol(ip.protocol()));
        }
        let payload = ip.payload();
        if payload.len() < HEADER_LEN {
            return Err(ParseError::MalformedUdpDatagram);
        }
        let length = read_u16(payload, field::LENGTH) as usize;
        if length < HEADER_LEN || length > payload.len() {
            return Err(ParseError::MalformedUdpDatagram);
        }
        Ok(Self { ip })
    }

    /// Reply datagram for `reference`: swapped addresses and ports, carrying
    /// `payload`. Lengths and checksums are already up to date.
    pub fn reply_to(reference: &UdpPacket, payload: &[u8], identification: u16) -> Self {
        let mut ip = IpPacket::reply_to(&reference.ip, identification);
        ip.set_payload(&[0u8; HEADER_LEN]);
        let mut reply = Self { ip };
        reply.set_source_port(reference.destination_port());
        reply.set_destination_port(reference.source_port());
        reply.set_payload(payload);
        reply.update_lengths_and_checksums();
        reply
    }

    pub fn ip(&self) -> &IpPacket {
        &self.ip
    }

    pub fn into_ip(self) -> IpPacket {
        self.ip
    }

    pub fn source_port(&self) -> u16 {
        read_u16(self.ip.payload(), field::SRC_PORT)
    }

    pub fn set_source_port(&mut self, port: u16) {
        write_u16(self.ip.payload_mut(), field::SRC_PORT, port);
    }

    pub fn destination_port(&self) -> u16 {
        read_u16(self.ip.payload(), field::DST_PORT)
    }

    pub fn set_destination_port(&mut self, port: u16) {
        write_u16(self.ip.payload_mut(), field::DST_PORT, port);
    }

    /// Length field as carried on the wire (header + data).
    pub fn length(&self) -> u16 {
        read_u16(self.ip.payload(), field::LENGTH)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.ip.payload(), field::CHECKSUM)
    }

    pub fn payload(&self) -> &[u8] {
        let length = (self.length() as usize).min(self.ip.payload().len());
        &self.ip.payload()[HEADER_LEN..length.max(HEADER_LEN)]
    }

    /// Keeps the 8-byte header, replaces the data and rewrites the length.
    pub fn set_payload(&mut self, payload: &[u8]) {
        let mut segment = Vec::with_capacity(HEADER_LEN + payload.len());
        segment.extend_from_slice(&self.ip.payload()[..HEADER_LEN]);
        segment.extend_from_slice(payload);
        let length = segment.len().min(u16::MAX as usize) as u16;
        write_u16(&mut segment, field::LENGTH, length);
        self.ip.set_payload(&segment);
    }

    pub fn compute_checksum(&self) -> u16 {
        let sum = checksum::transport(
            self.ip.source(),
            self.ip.destination(),
            IpProtocol::Udp,
            self.ip.payload(),
            field::CHECKSUM,
        )
        .unwrap_or(0);
        // zero means "no checksum" on the wire
        if sum == 0 {
            0xFFFF
        } else {
            sum
        }
    }

    pub fn update_lengths_and_checksums(&mut self) {
        let length = self.ip.payload().len().min(u16::MAX as usize) as u16;
        write_u16(self.ip.payload_mut(), field::LENGTH, length);
        self.ip.update_lengths_and_checksums();
        let sum = self.compute_checksum();
        write_u16(self.ip.payload_mut(), field::CHECKSUM, sum);
    }
}

impl fmt::Display for UdpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UDP {}:{} -> {}:{} len={}",
            self.ip.source(),
            self.source_port(),
            self.ip.destination(),
            self.destination_port(),
            self.payload().len()
        )
    }
}

impl fmt::Debug for UdpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
