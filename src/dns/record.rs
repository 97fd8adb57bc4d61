use super::{DnsError, DnsName};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Other(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            6 => RecordType::Soa,
            12 => RecordType::Ptr,
            15 => RecordType::Mx,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            other => RecordType::Other(other),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Other(other) => other,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => f.write_str("A"),
            RecordType::Ns => f.write_str("NS"),
            RecordType::Cname => f.write_str("CNAME"),
            RecordType::Soa => f.write_str("SOA"),
            RecordType::Ptr => f.write_str("PTR"),
            RecordType::Mx => f.write_str("MX"),
            RecordType::Txt => f.write_str("TXT"),
            RecordType::Aaaa => f.write_str("AAAA"),
            RecordType::Other(value) => write!(f, "TYPE{value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordClass {
    In,
    Other(u16),
}

impl From<u16> for RecordClass {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordClass::In,
            other => RecordClass::Other(other),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::In => 1,
            RecordClass::Other(other) => other,
        }
    }
}

fn read_u16_at(message: &[u8], offset: usize) -> Result<u16, DnsError> {
    message
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DnsError::Truncated)
}

fn read_u32_at(message: &[u8], offset: usize) -> Result<u32, DnsError> {
    message
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DnsError::Truncated)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: DnsName,
    pub record_type: RecordType,
    pub record_class: RecordClass,
}

impl DnsQuestion {
    pub fn new(name: &str, record_type: RecordType) -> Result<Self, DnsError> {
        Ok(Self {
            name: DnsName::new(name)?,
            record_type,
            record_class: RecordClass::In,
        })
    }

    pub fn parse(message: &[u8], offset: usize) -> Result<Self, DnsError> {
        let name = DnsName::read(message, offset)?;
        let fixed = offset + name.encoded_len();
        let record_type = RecordType::from(read_u16_at(message, fixed)?);
        let record_class = RecordClass::from(read_u16_at(message, fixed + 2)?);
        Ok(Self {
            name,
            record_type,
            record_class,
        })
    }

    /// Bytes this question occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        self.name.encoded_len() + 4
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.name.encode_into(out);
        out.extend_from_slice(&u16::from(self.record_type).to_be_bytes());
        out.extend_from_slice(&u16::from(self.record_class).to_be_bytes());
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.record_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: DnsName,
    pub record_type: RecordType,
    pub record_class: RecordClass,
    pub ttl: u32,
    pub data: Vec<u8>,
    /// Decoded target for CNAME/NS/PTR records; resolved against the whole
    /// message so compressed targets survive.
    target: Option<DnsName>,
}

impl DnsRecord {
    pub fn new(
        name: &str,
        record_type: RecordType,
        ttl: u32,
        data: Vec<u8>,
    ) -> Result<Self, DnsError> {
        if data.len() > usize::from(u16::MAX) {
            return Err(DnsError::ResourceDataTooLong(data.len()));
        }
        let target = match record_type {
            RecordType::Cname | RecordType::Ns | RecordType::Ptr => DnsName::read(&data, 0).ok(),
            _ => None,
        };
        Ok(Self {
            name: DnsName::new(name)?,
            record_type,
            record_class: RecordClass::In,
            ttl,
            data,
            target,
        })
    }

    pub fn a(name: &str, address: Ipv4Addr, ttl: u32) -> Result<Self, DnsError> {
        Self::new(name, RecordType::A, ttl, address.octets().to_vec())
    }

    pub fn aaaa(name: &str, address: Ipv6Addr, ttl: u32) -> Result<Self, DnsError> {
        Self::new(name, RecordType::Aaaa, ttl, address.octets().to_vec())
    }

    pub fn cname(name: &str, target: &str, ttl: u32) -> Result<Self, DnsError> {
        let target = DnsName::new(target)?;
        let mut data = Vec::with_capacity(target.encoded_len());
        target.encode_into(&mut data);
        Self::new(name, RecordType::Cname, ttl, data)
    }

    pub fn parse(message: &[u8], offset: usize) -> Result<Self, DnsError> {
        let name = DnsName::read(message, offset)?;
        let fixed = offset + name.encoded_len();
        let record_type = RecordType::from(read_u16_at(message, fixed)?);
        let record_class = RecordClass::from(read_u16_at(message, fixed + 2)?);
        let ttl = read_u32_at(message, fixed + 4)?;
        let data_len = usize::from(read_u16_at(message, fixed + 8)?);
        let data_start = fixed + 10;
        let data = message
            .get(data_start..data_start + data_len)
            .ok_or(DnsError::Truncated)?
            .to_vec();
        let target = match record_type {
            RecordType::Cname | RecordType::Ns | RecordType::Ptr => {
                Some(DnsName::read(message, data_start)?)
            }
            _ => None,
        };
        Ok(Self {
            name,
            record_type,
            record_class,
            ttl,
            data,
            target,
        })
    }

    /// Bytes this record occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        self.name.encoded_len() + 10 + self.data.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.name.encode_into(out);
        out.extend_from_slice(&u16::from(self.record_type).to_be_bytes());
        out.extend_from_slice(&u16::from(self.record_class).to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
    }

    /// Address carried by an A or AAAA record.
    pub fn address(&self) -> Option<IpAddr> {
        match self.record_type {
            RecordType::A => {
                let octets: [u8; 4] = self.data.as_slice().try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            RecordType::Aaaa => {
                let octets: [u8; 16] = self.data.as_slice().try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    pub fn target(&self) -> Option<&DnsName> {
        self.target.as_ref()
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ttl={}", self.name, self.record_type, self.ttl)?;
        if let Some(address) = self.address() {
            write!(f, " {address}")?;
        } else if let Some(target) = &self.target {
            write!(f, " {target}")?;
        }
        Ok(())
    }
}
