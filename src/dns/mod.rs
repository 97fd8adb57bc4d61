//! DNS wire codec plus the blocking resolvers used for names the engine does
//! not intercept.

mod message;
mod name;
mod record;
mod system;
mod upstream;

pub use message::{DnsMessage, OpCode, ResponseCode, HEADER_LEN};
pub use name::{DnsName, MAX_LABEL_LEN, MAX_NAME_LEN};
pub use record::{DnsQuestion, DnsRecord, RecordClass, RecordType};
pub use system::SystemResolver;
pub use upstream::{UpstreamResolver, DEFAULT_TIMEOUT as UPSTREAM_TIMEOUT};

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

pub const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("message truncated")]
    Truncated,
    #[error("compression pointer loop at offset {0}")]
    PointerLoop(usize),
    #[error("unsupported label type {0:#04x}")]
    UnsupportedLabelType(u8),
    #[error("empty label")]
    EmptyLabel,
    #[error("label of {0} bytes exceeds 63")]
    LabelTooLong(usize),
    #[error("name exceeds 255 bytes")]
    NameTooLong,
    #[error("resource data of {0} bytes exceeds 65535")]
    ResourceDataTooLong(usize),
    #[error("section of {0} entries exceeds 65535")]
    SectionOverflow(usize),
}

/// Addresses a response carries for one of its question names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMapping {
    pub host: String,
    pub addresses: Vec<IpAddr>,
    pub ttl: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsupported hostname")]
    Unsupported,
    #[error("lookup failed: {0}")]
    LookupFailed(String),
}

/// Blocking name lookup used for names outside the intercepted set.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub addresses: Vec<IpAddr>,
    pub ttl: Duration,
}

impl ResolveOutcome {
    pub fn first_ipv4(&self) -> Option<std::net::Ipv4Addr> {
        self.addresses.iter().find_map(|address| match address {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }
}

/// Maps question names of a response to the addresses in its answer
/// section, following CNAME chains back to the name that was asked.
pub fn parse_response(message: &DnsMessage) -> Vec<DnsMapping> {
    if !message.is_response() {
        return Vec::new();
    }
    let (Ok(questions), Ok(answers)) = (message.questions(), message.answers()) else {
        return Vec::new();
    };
    let mut alias_roots: HashMap<String, Vec<String>> = HashMap::new();
    for question in &questions {
        let name = question.name.as_str().to_ascii_lowercase();
        alias_roots
            .entry(name.clone())
            .or_insert_with(|| vec![name]);
    }
    let mut host_map: HashMap<String, DnsMapping> = HashMap::new();
    for record in &answers {
        let name = record.name.as_str().to_ascii_lowercase();
        match record.record_type {
            RecordType::A | RecordType::Aaaa => {
                let Some(address) = record.address() else {
                    continue;
                };
                for root in lookup_roots(&alias_roots, &name) {
                    insert_mapping(&mut host_map, &root, address, record.ttl);
                }
            }
            RecordType::Cname => {
                let Some(target) = record.target() else {
                    continue;
                };
                let roots = lookup_roots(&alias_roots, &name);
                let entry = alias_roots
                    .entry(target.as_str().to_ascii_lowercase())
                    .or_default();
                for root in roots {
                    if !entry.contains(&root) {
                        entry.push(root);
                    }
                }
            }
            _ => continue,
        }
    }
    host_map.into_values().collect()
}

fn insert_mapping(map: &mut HashMap<String, DnsMapping>, name: &str, address: IpAddr, ttl: u32) {
    let entry = map.entry(name.to_string()).or_insert(DnsMapping {
        host: name.to_string(),
        addresses: Vec::new(),
        ttl: Some(ttl),
    });
    if !entry.addresses.contains(&address) {
        entry.addresses.push(address);
    }
    entry.ttl = entry.ttl.map(|current| current.min(ttl));
}

fn lookup_roots(alias_roots: &HashMap<String, Vec<String>>, name: &str) -> Vec<String> {
    alias_roots
        .get(name)
        .cloned()
        .unwrap_or_else(|| vec![name.to_string()])
}
