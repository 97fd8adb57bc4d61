//! TCP segment view over an owned IP packet, plus the option codec.

use super::{
    checksum, read_u16, read_u32, write_u16, write_u32, IpHeader, IpPacket, IpProtocol,
    ParseError,
};
use bitflags::bitflags;
use smallvec::SmallVec;
use std::fmt;
use std::net::SocketAddr;

pub const MIN_HEADER_LEN: usize = 20;
pub const MAX_OPTIONS_LEN: usize = 40;

mod field {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const SEQ: usize = 4;
    pub const ACK: usize = 8;
    pub const DATA_OFFSET: usize = 12;
    pub const FLAGS: usize = 13;
    pub const WINDOW: usize = 14;
    pub const CHECKSUM: usize = 16;
    pub const URGENT: usize = 18;
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 8] = [
            (TcpFlags::CWR, "CWR"),
            (TcpFlags::ECE, "ECE"),
            (TcpFlags::URG, "URG"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::FIN, "FIN"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

pub mod option_kind {
    pub const END_OF_LIST: u8 = 0;
    pub const NO_OPERATION: u8 = 1;
    pub const MAX_SEGMENT_SIZE: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    /// Any other kind, carried through byte for byte.
    Unknown { kind: u8, data: SmallVec<[u8; 8]> },
}

impl TcpOption {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            TcpOption::EndOfList => out.push(option_kind::END_OF_LIST),
            TcpOption::NoOperation => out.push(option_kind::NO_OPERATION),
            TcpOption::MaxSegmentSize(mss) => {
                out.extend_from_slice(&[option_kind::MAX_SEGMENT_SIZE, 4]);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                out.extend_from_slice(&[option_kind::WINDOW_SCALE, 3, *shift]);
            }
            TcpOption::Unknown { kind, data } => {
                out.push(*kind);
                out.push((data.len() + 2) as u8);
                out.extend_from_slice(data);
            }
        }
    }
}

/// Ordered option list as found between the fixed header and the data offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpOptions {
    options: SmallVec<[TcpOption; 4]>,
}

impl TcpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut options = SmallVec::new();
        let mut index = 0;
        while index < bytes.len() {
            let kind = bytes[index];
            match kind {
                option_kind::END_OF_LIST => {
                    options.push(TcpOption::EndOfList);
                    break;
                }
                option_kind::NO_OPERATION => {
                    options.push(TcpOption::NoOperation);
                    index += 1;
                }
                _ => {
                    let Some(&len) = bytes.get(index + 1) else {
                        return Err(ParseError::MalformedTcpSegment);
                    };
                    let len = usize::from(len);
                    if len < 2 || index + len > bytes.len() {
                        return Err(ParseError::MalformedTcpSegment);
                    }
                    let data = &bytes[index + 2..index + len];
                    let option = match (kind, data.len()) {
                        (option_kind::MAX_SEGMENT_SIZE, 2) => {
                            TcpOption::MaxSegmentSize(u16::from_be_bytes([data[0], data[1]]))
                        }
                        (option_kind::WINDOW_SCALE, 1) => TcpOption::WindowScale(data[0]),
                        _ => TcpOption::Unknown {
                            kind,
                            data: SmallVec::from_slice(data),
                        },
                    };
                    options.push(option);
                    index += len;
                }
            }
        }
        Ok(Self { options })
    }

    /// Wire encoding padded with end-of-list bytes to a 4-byte boundary.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_OPTIONS_LEN);
        for option in &self.options {
            option.encode_into(&mut out);
        }
        while out.len() % 4 != 0 {
            out.push(option_kind::END_OF_LIST);
        }
        out
    }

    pub fn push(&mut self, option: TcpOption) {
        self.options.push(option);
    }

    pub fn iter(&self) -> impl Iterator<Item = &TcpOption> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn max_segment_size(&self) -> Option<u16> {
        self.options.iter().find_map(|option| match option {
            TcpOption::MaxSegmentSize(mss) => Some(*mss),
            _ => None,
        })
    }

    pub fn window_scale(&self) -> Option<u8> {
        self.options.iter().find_map(|option| match option {
            TcpOption::WindowScale(shift) => Some(*shift),
            _ => None,
        })
    }
}

impl FromIterator<TcpOption> for TcpOptions {
    fn from_iter<I: IntoIterator<Item = TcpOption>>(iter: I) -> Self {
        Self {
            options: iter.into_iter().collect(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TcpPacket {
    ip: IpPacket,
}

impl TcpPacket {
    pub fn parse(ip: IpPacket) -> Result<Self, ParseError> {
        if ip.protocol() != IpProtocol::Tcp {
            return Err(ParseError::UnexpectedProtocol(ip.protocol()));
        }
        let payload = ip.payload();
        if payload.len() < MIN_HEADER_LEN {
            return Err(ParseError::MalformedTcpSegment);
        }
        let header_len = usize::from(payload[field::DATA_OFFSET] >> 4) * 4;
        if header_len < MIN_HEADER_LEN || header_len > payload.len() {
            return Err(ParseError::MalformedTcpSegment);
        }
        Ok(Self { ip })
    }

    /// Empty segment (20-byte header, no flags) between two endpoints.
    pub fn build(
        source: SocketAddr,
        destination: SocketAddr,
        identification: u16,
    ) -> Result<Self, ParseError> {
        let mut ip = IpPacket::new(
            source.ip(),
            destination.ip(),
            IpProtocol::Tcp,
            identification,
        )?;
        let mut header = [0u8; MIN_HEADER_LEN];
        header[field::DATA_OFFSET] = 5 << 4;
        ip.set_payload(&header);
        let mut packet = Self { ip };
        packet.set_source_port(source.port());
        packet.set_destination_port(destination.port());
        Ok(packet)
    }

    pub fn ip(&self) -> &IpPacket {
        &self.ip
    }

    pub fn into_ip(self) -> IpPacket {
        self.ip
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.ip.source(), self.source_port())
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.ip.destination(), self.destination_port())
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

    pub fn sequence_number(&self) -> u32 {
        read_u32(self.ip.payload(), field::SEQ)
    }

    pub fn set_sequence_number(&mut self, value: u32) {
        write_u32(self.ip.payload_mut(), field::SEQ, value);
    }

    pub fn acknowledgment_number(&self) -> u32 {
        read_u32(self.ip.payload(), field::ACK)
    }

    pub fn set_acknowledgment_number(&mut self, value: u32) {
        write_u32(self.ip.payload_mut(), field::ACK, value);
    }

    /// Header length in 32-bit words.
    pub fn data_offset(&self) -> u8 {
        self.ip.payload()[field::DATA_OFFSET] >> 4
    }

    fn set_data_offset(&mut self, words: u8) {
        let byte = &mut self.ip.payload_mut()[field::DATA_OFFSET];
        *byte = (words << 4) | (*byte & 0x0F);
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.data_offset()) * 4
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_truncate(self.ip.payload()[field::FLAGS])
    }

    pub fn set_flags(&mut self, flags: TcpFlags) {
        self.ip.payload_mut()[field::FLAGS] = flags.bits();
    }

    pub fn set_flag(&mut self, flag: TcpFlags, value: bool) {
        let mut flags = self.flags();
        flags.set(flag, value);
        self.set_flags(flags);
    }

    pub fn syn(&self) -> bool {
        self.flags().contains(TcpFlags::SYN)
    }

    pub fn ack(&self) -> bool {
        self.flags().contains(TcpFlags::ACK)
    }

    pub fn fin(&self) -> bool {
        self.flags().contains(TcpFlags::FIN)
    }

    pub fn rst(&self) -> bool {
        self.flags().contains(TcpFlags::RST)
    }

    pub fn psh(&self) -> bool {
        self.flags().contains(TcpFlags::PSH)
    }

    pub fn urg(&self) -> bool {
        self.flags().contains(TcpFlags::URG)
    }

    pub fn ece(&self) -> bool {
        self.flags().contains(TcpFlags::ECE)
    }

    pub fn cwr(&self) -> bool {
        self.flags().contains(TcpFlags::CWR)
    }

    pub fn window(&self) -> u16 {
        read_u16(self.ip.payload(), field::WINDOW)
    }

    pub fn set_window(&mut self, value: u16) {
        write_u16(self.ip.payload_mut(), field::WINDOW, value);
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.ip.payload(), field::CHECKSUM)
    }

    pub fn urgent_pointer(&self) -> u16 {
        read_u16(self.ip.payload(), field::URGENT)
    }

    pub fn set_urgent_pointer(&mut self, value: u16) {
        write_u16(self.ip.payload_mut(), field::URGENT, value);
    }

    /// Raw option bytes, padding included.
    pub fn option_bytes(&self) -> &[u8] {
        &self.ip.payload()[MIN_HEADER_LEN..self.header_len()]
    }

    pub fn options(&self) -> Result<TcpOptions, ParseError> {
        TcpOptions::parse(self.option_bytes())
    }

    /// Re-encodes the option region, moving the payload and adjusting the
    /// data offset.
    pub fn set_options(&mut self, options: &TcpOptions) -> Result<(), ParseError> {
        let encoded = options.encode();
        if encoded.len() > MAX_OPTIONS_LEN {
            return Err(ParseError::MalformedTcpSegment);
        }
        let header_len = self.header_len();
        let mut segment = Vec::with_capacity(MIN_HEADER_LEN + encoded.len() + self.payload().len());
        segment.extend_from_slice(&self.ip.payload()[..MIN_HEADER_LEN]);
        segment.extend_from_slice(&encoded);
        segment.extend_from_slice(&self.ip.payload()[header_len..]);
        self.ip.set_payload(&segment);
        self.set_data_offset(((MIN_HEADER_LEN + encoded.len()) / 4) as u8);
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.ip.payload()[self.header_len()..]
    }

    /// Keeps header and options, replaces the data after them.
    pub fn set_payload(&mut self, payload: &[u8]) {
        let header_len = self.header_len();
        let mut segment = Vec::with_capacity(header_len + payload.len());
        segment.extend_from_slice(&self.ip.payload()[..header_len]);
        segment.extend_from_slice(payload);
        self.ip.set_payload(&segment);
    }

    /// Sequence space consumed by this segment: data plus one for SYN and FIN.
    pub fn segment_len(&self) -> u32 {
        let mut len = self.payload().len() as u32;
        if self.syn() {
            len = len.wrapping_add(1);
        }
        if self.fin() {
            len = len.wrapping_add(1);
        }
        len
    }

    pub fn compute_checksum(&self) -> u16 {
        checksum::transport(
            self.ip.source(),
            self.ip.destination(),
            IpProtocol::Tcp,
            self.ip.payload(),
            field::CHECKSUM,
        )
        .unwrap_or(0)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum() == self.compute_checksum()
    }

    pub fn update_lengths_and_checksums(&mut self) {
        self.ip.update_lengths_and_checksums();
        let sum = self.compute_checksum();
        write_u16(self.ip.payload_mut(), field::CHECKSUM, sum);
    }
}

impl fmt::Display for TcpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP {} -> {} [{}] seq={} ack={} win={} len={}",
            self.source(),
            self.destination(),
            self.flags(),
            self.sequence_number(),
            self.acknowledgment_number(),
            self.window(),
            self.payload().len()
        )
    }
}

impl fmt::Debug for TcpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
