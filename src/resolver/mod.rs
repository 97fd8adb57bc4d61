//! DNS interception: hands out synthetic addresses for intercepted hostnames
//! and answers queries sent to the tunnel's DNS addresses.

mod entries;

pub use entries::{DnsEntries, DnsEntry};

use crate::config::TunnelConfig;
use crate::dns::{
    DnsMessage, DnsQuestion, DnsRecord, OpCode, RecordType, ResponseCode, Resolver, DNS_PORT,
};
use crate::error::BridgeError;
use crate::logger::{BreadcrumbFlags, ErrorCategory, Logger};
use crate::packet::{IpHeader, IpPacket, UdpPacket};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use wildmatch::WildMatch;

/// Synthetic answers must never be cached by the client.
const ANSWER_TTL: u32 = 0;

/// What a reply communicates, independent of the wire response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    /// Intercepted name, synthetic A records attached.
    Answered,
    NameError,
    NotImplemented,
    /// Name outside the match domains resolved through the fallback
    /// resolver. The wire code stays `nameError`.
    FallbackAnswer,
}

pub enum Resolution {
    Reply { packet: IpPacket, status: ResolveStatus },
    /// Needs a blocking lookup; complete it off the routing loop.
    Fallback(PendingFallback),
    /// Not a query we answer (response, or not DNS at all).
    Ignored,
}

/// A query waiting on the fallback resolver.
pub struct PendingFallback {
    query: UdpPacket,
    message: DnsMessage,
    question: DnsQuestion,
    identification: u16,
    resolver: Arc<dyn Resolver>,
}

impl PendingFallback {
    pub fn hostname(&self) -> &str {
        self.question.name.as_str()
    }

    /// Runs the lookup. Blocking.
    pub fn complete(self) -> Option<(IpPacket, ResolveStatus)> {
        let address = self
            .resolver
            .resolve(self.question.name.as_str())
            .ok()
            .and_then(|outcome| outcome.first_ipv4());
        let (answers, status) = match address {
            Some(address) => match DnsRecord::a(self.question.name.as_str(), address, ANSWER_TTL) {
                Ok(record) => (vec![record], ResolveStatus::FallbackAnswer),
                Err(_) => (Vec::new(), ResolveStatus::NameError),
            },
            None => (Vec::new(), ResolveStatus::NameError),
        };
        let packet = build_reply(
            &self.query,
            &self.message,
            &[self.question],
            &answers,
            ResponseCode::NameError,
            self.identification,
        )?;
        Some((packet, status))
    }
}

enum DomainMatcher {
    Suffix(String),
    Pattern(WildMatch),
}

impl DomainMatcher {
    fn new(domain: &str) -> Self {
        let normalized = domain.trim_end_matches('.').to_ascii_lowercase();
        if normalized.contains(['*', '?']) {
            DomainMatcher::Pattern(WildMatch::new(&normalized))
        } else {
            DomainMatcher::Suffix(normalized)
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            DomainMatcher::Suffix(domain) => {
                name == domain
                    || (name.len() > domain.len()
                        && name.ends_with(domain.as_str())
                        && name.as_bytes()[name.len() - domain.len() - 1] == b'.')
            }
            DomainMatcher::Pattern(pattern) => pattern.matches(name),
        }
    }
}

pub struct DnsResolver {
    tunnel_ip: Ipv4Addr,
    network: Ipv4Addr,
    broadcast: Ipv4Addr,
    dns_addresses: Vec<IpAddr>,
    match_domains: Vec<DomainMatcher>,
    entries: Mutex<DnsEntries>,
    fallback: Arc<dyn Resolver>,
    logger: Logger,
}

impl DnsResolver {
    pub fn new(config: &TunnelConfig, fallback: Arc<dyn Resolver>, logger: Logger) -> Self {
        Self {
            tunnel_ip: config.ip,
            network: config.network(),
            broadcast: config.broadcast(),
            dns_addresses: config.dns_addresses.clone(),
            match_domains: config
                .match_domains
                .iter()
                .filter(|domain| !domain.is_empty())
                .map(|domain| DomainMatcher::new(domain))
                .collect(),
            entries: Mutex::new(DnsEntries::default()),
            fallback,
            logger,
        }
    }

    /// Registers `hostname` for `service_id` and returns its synthetic
    /// address, reusing the existing one for a known hostname. `None` when
    /// the subnet has no free address left.
    pub fn add_hostname(&self, hostname: &str, service_id: &str) -> Option<Ipv4Addr> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.find(hostname).map(|entry| entry.address) {
            entries.add(hostname, existing, service_id);
            return Some(existing);
        }
        let Some(address) = self.next_free_address(&entries) else {
            drop(entries);
            self.logger.rate_limited_error(
                ErrorCategory::AddressExhausted,
                format!("{} ({hostname})", BridgeError::AddressExhaustion),
            );
            return None;
        };
        entries.add(hostname, address, service_id);
        drop(entries);
        self.logger.breadcrumb_with(BreadcrumbFlags::DNS, || {
            format!("intercepting {hostname} at {address} for {service_id}")
        });
        Some(address)
    }

    fn next_free_address(&self, entries: &DnsEntries) -> Option<Ipv4Addr> {
        let first = u32::from(self.network).checked_add(1)?;
        let last = u32::from(self.broadcast);
        (first..last).map(Ipv4Addr::from).find(|candidate| {
            *candidate != self.tunnel_ip
                && !self.dns_addresses.contains(&IpAddr::V4(*candidate))
                && !entries.is_assigned(*candidate)
        })
    }

    /// Drops `service_id` from every hostname; hostnames left without a
    /// service are forgotten and their addresses become free.
    pub fn remove_service(&self, service_id: &str) -> Vec<String> {
        let removed = self.entries.lock().remove_service(service_id);
        if !removed.is_empty() {
            self.logger.breadcrumb_with(BreadcrumbFlags::DNS, || {
                format!("released {} for {service_id}", removed.join(", "))
            });
        }
        removed
    }

    pub fn find_by_ip(&self, address: IpAddr) -> Vec<DnsEntry> {
        match address {
            IpAddr::V4(v4) => self.entries.lock().by_address(v4),
            IpAddr::V6(_) => Vec::new(),
        }
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.entries.lock().hostnames()
    }

    pub fn needs_resolution(&self, udp: &UdpPacket) -> bool {
        udp.destination_port() == DNS_PORT
            && self.dns_addresses.contains(&udp.ip().destination())
    }

    fn in_match_domains(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        self.match_domains.iter().any(|domain| domain.matches(&name))
    }

    /// Answers one DNS query datagram.
    pub fn resolve(&self, udp: &UdpPacket, identification: u16) -> Resolution {
        let message = match DnsMessage::parse(udp.payload().to_vec()) {
            Ok(message) => message,
            Err(err) => {
                self.logger
                    .breadcrumb(BreadcrumbFlags::DNS, format!("undecodable DNS query: {err}"));
                return Resolution::Ignored;
            }
        };
        if message.is_response() {
            self.logger
                .breadcrumb(BreadcrumbFlags::DNS, "ignoring DNS response sent to resolver");
            return Resolution::Ignored;
        }
        let questions = match message.questions() {
            Ok(questions) => questions,
            Err(_) => return Resolution::Ignored,
        };
        self.logger
            .breadcrumb_with(BreadcrumbFlags::DNS, || format!("DNS--> {message}"));

        let (answers, code, status) = match questions.as_slice() {
            [question] if message.opcode() == OpCode::Query => {
                match self.answer(question) {
                    Some(answer) => answer,
                    None => {
                        return Resolution::Fallback(PendingFallback {
                            query: udp.clone(),
                            message,
                            question: question.clone(),
                            identification,
                            resolver: Arc::clone(&self.fallback),
                        })
                    }
                }
            }
            _ => (Vec::new(), ResponseCode::NotImplemented, ResolveStatus::NotImplemented),
        };

        match build_reply(udp, &message, &questions, &answers, code, identification) {
            Some(packet) => Resolution::Reply { packet, status },
            None => Resolution::Ignored,
        }
    }

    /// Local answer for a single question, or `None` when it has to go to
    /// the fallback resolver.
    fn answer(&self, question: &DnsQuestion) -> Option<(Vec<DnsRecord>, ResponseCode, ResolveStatus)> {
        let name = question.name.as_str();
        let entry = self.entries.lock().find(name).cloned();
        let in_domains = self.in_match_domains(name);
        match (question.record_type, entry) {
            (RecordType::A, Some(entry)) => {
                let answers: Vec<DnsRecord> = DnsRecord::a(name, entry.address, ANSWER_TTL)
                    .into_iter()
                    .collect();
                Some((answers, ResponseCode::NoError, ResolveStatus::Answered))
            }
            (RecordType::A, None) if !in_domains => None,
            // synthetic addresses are IPv4 only, and the fallback only asks
            // for A records
            (RecordType::A | RecordType::Aaaa, _) => {
                Some((Vec::new(), ResponseCode::NameError, ResolveStatus::NameError))
            }
            _ => Some((Vec::new(), ResponseCode::NotImplemented, ResolveStatus::NotImplemented)),
        }
    }
}

fn build_reply(
    query: &UdpPacket,
    message: &DnsMessage,
    questions: &[DnsQuestion],
    answers: &[DnsRecord],
    code: ResponseCode,
    identification: u16,
) -> Option<IpPacket> {
    let mut reply = DnsMessage::reply_to_query(message, questions, answers).ok()?;
    reply.set_response_code(code);
    let udp = UdpPacket::reply_to(query, reply.as_bytes(), identification);
    Some(udp.into_ip())
}

#[cfg(test)]
mod tests;
