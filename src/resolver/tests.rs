use super::*;
use crate::dns::{ResolveError, ResolveOutcome};
use crate::packet::IpProtocol;
use std::time::Duration;

struct FixedResolver(Option<IpAddr>);

impl Resolver for FixedResolver {
    fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError> {
        match self.0 {
            Some(address) => Ok(ResolveOutcome {
                addresses: vec![address],
                ttl: Duration::from_secs(30),
            }),
            None => Err(ResolveError::LookupFailed(host.to_string())),
        }
    }
}

fn config() -> TunnelConfig {
    TunnelConfig {
        match_domains: vec!["corp.example".into(), "*.lab.test".into()],
        ..TunnelConfig::default()
    }
}

fn resolver_with(config: &TunnelConfig, fallback: Option<IpAddr>) -> DnsResolver {
    DnsResolver::new(config, Arc::new(FixedResolver(fallback)), Logger::new())
}

fn resolver() -> DnsResolver {
    resolver_with(&config(), Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))))
}

fn query_packet(message: &DnsMessage) -> UdpPacket {
    let mut ip = IpPacket::new(
        IpAddr::V4(Ipv4Addr::new(169, 254, 126, 1)),
        IpAddr::V4(Ipv4Addr::new(169, 254, 126, 2)),
        IpProtocol::Udp,
        1,
    )
    .unwrap();
    let mut datagram = Vec::new();
    datagram.extend_from_slice(&53_000u16.to_be_bytes());
    datagram.extend_from_slice(&DNS_PORT.to_be_bytes());
    datagram.extend_from_slice(&((8 + message.as_bytes().len()) as u16).to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(message.as_bytes());
    ip.set_payload(&datagram);
    ip.update_lengths_and_checksums();
    UdpPacket::parse(ip).unwrap()
}

fn query(name: &str, record_type: RecordType) -> UdpPacket {
    query_packet(&DnsMessage::query(0x1234, name, record_type).unwrap())
}

fn reply(resolution: Resolution) -> (DnsMessage, ResolveStatus, UdpPacket) {
    match resolution {
        Resolution::Reply { packet, status } => {
            let udp = UdpPacket::parse(packet).unwrap();
            let message = DnsMessage::parse(udp.payload().to_vec()).unwrap();
            (message, status, udp)
        }
        Resolution::Fallback(_) => panic!("unexpected fallback"),
        Resolution::Ignored => panic!("query ignored"),
    }
}

#[test]
fn allocates_distinct_addresses_skipping_reserved() {
    let resolver = resolver();
    let first = resolver.add_hostname("one.corp.example", "svc-a").unwrap();
    let second = resolver.add_hostname("two.corp.example", "svc-a").unwrap();
    assert_eq!(first, Ipv4Addr::new(169, 254, 126, 3));
    assert_eq!(second, Ipv4Addr::new(169, 254, 126, 4));
    assert_ne!(first, second);

    // same hostname, any case, keeps its address
    let again = resolver.add_hostname("ONE.corp.example", "svc-b").unwrap();
    assert_eq!(again, first);
    assert_eq!(resolver.hostnames(), vec!["one.corp.example", "two.corp.example"]);
}

#[test]
fn allocation_fails_cleanly_when_subnet_is_full() {
    let config = TunnelConfig {
        ip: Ipv4Addr::new(10, 9, 0, 1),
        subnet_mask: Ipv4Addr::new(255, 255, 255, 248),
        dns_addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 9, 0, 2))],
        ..TunnelConfig::default()
    };
    let resolver = resolver_with(&config, None);
    let assigned: Vec<Ipv4Addr> = (0..4)
        .map(|idx| resolver.add_hostname(&format!("host{idx}.test"), "svc").unwrap())
        .collect();
    assert_eq!(
        assigned,
        vec![
            Ipv4Addr::new(10, 9, 0, 3),
            Ipv4Addr::new(10, 9, 0, 4),
            Ipv4Addr::new(10, 9, 0, 5),
            Ipv4Addr::new(10, 9, 0, 6),
        ]
    );
    assert_eq!(resolver.add_hostname("overflow.test", "svc"), None);
    // existing names still resolve to their address
    assert_eq!(
        resolver.add_hostname("host0.test", "other"),
        Some(Ipv4Addr::new(10, 9, 0, 3))
    );
}

#[test]
fn removing_last_service_frees_address() {
    let resolver = resolver();
    let shared = resolver.add_hostname("shared.corp.example", "svc-a").unwrap();
    resolver.add_hostname("shared.corp.example", "svc-b");
    let solo = resolver.add_hostname("solo.corp.example", "svc-a").unwrap();

    assert_eq!(resolver.remove_service("svc-a"), vec!["solo.corp.example"]);
    let remaining = resolver.find_by_ip(IpAddr::V4(shared));
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].service_ids, vec!["svc-b"]);
    assert!(resolver.find_by_ip(IpAddr::V4(solo)).is_empty());

    // the freed address is handed out again
    assert_eq!(resolver.add_hostname("new.corp.example", "svc-c"), Some(solo));
}

#[test]
fn needs_resolution_checks_port_and_address() {
    let resolver = resolver();
    assert!(resolver.needs_resolution(&query("x.corp.example", RecordType::A)));

    let mut other_port = query("x.corp.example", RecordType::A);
    other_port.set_destination_port(5353);
    assert!(!resolver.needs_resolution(&other_port));
}

#[test]
fn answers_a_query_for_intercepted_name() {
    let resolver = resolver();
    let address = resolver.add_hostname("api.corp.example", "svc").unwrap();

    let (message, status, udp) = reply(resolver.resolve(&query("API.corp.example", RecordType::A), 9));
    assert_eq!(status, ResolveStatus::Answered);
    assert_eq!(message.id(), 0x1234);
    assert!(message.is_response());
    assert!(message.authoritative());
    assert!(message.recursion_desired());
    assert_eq!(message.response_code(), ResponseCode::NoError);
    assert_eq!(message.question_count(), 1);
    let answers = message.answers().unwrap();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].ttl, 0);
    assert_eq!(answers[0].address(), Some(IpAddr::V4(address)));

    assert_eq!(udp.source_port(), DNS_PORT);
    assert_eq!(udp.destination_port(), 53_000);
    assert_eq!(udp.ip().source(), IpAddr::V4(Ipv4Addr::new(169, 254, 126, 2)));
    assert_eq!(udp.ip().destination(), IpAddr::V4(Ipv4Addr::new(169, 254, 126, 1)));
    assert_eq!(udp.checksum(), udp.compute_checksum());
}

#[test]
fn aaaa_for_intercepted_name_is_name_error() {
    let resolver = resolver();
    resolver.add_hostname("api.corp.example", "svc");
    let (message, status, _) = reply(resolver.resolve(&query("api.corp.example", RecordType::Aaaa), 1));
    assert_eq!(status, ResolveStatus::NameError);
    assert_eq!(message.response_code(), ResponseCode::NameError);
    assert_eq!(message.answer_count(), 0);
}

#[test]
fn unknown_name_in_match_domain_is_name_error() {
    let resolver = resolver();
    for name in ["missing.corp.example", "corp.example", "box.lab.test"] {
        let (message, status, _) = reply(resolver.resolve(&query(name, RecordType::A), 1));
        assert_eq!(status, ResolveStatus::NameError, "{name}");
        assert_eq!(message.response_code(), ResponseCode::NameError);
        assert_eq!(message.answer_count(), 0);
    }
}

#[test]
fn two_questions_are_not_implemented() {
    let resolver = resolver();
    resolver.add_hostname("api.corp.example", "svc");
    let mut message = DnsMessage::query(7, "api.corp.example", RecordType::A).unwrap();
    message
        .set_questions(&[
            DnsQuestion::new("api.corp.example", RecordType::A).unwrap(),
            DnsQuestion::new("www.corp.example", RecordType::A).unwrap(),
        ])
        .unwrap();
    let (response, status, _) = reply(resolver.resolve(&query_packet(&message), 1));
    assert_eq!(status, ResolveStatus::NotImplemented);
    assert_eq!(response.response_code(), ResponseCode::NotImplemented);
    assert_eq!(response.question_count(), 2);
    assert_eq!(response.answer_count(), 0);
}

#[test]
fn other_record_types_are_not_implemented() {
    let resolver = resolver();
    let (message, status, _) = reply(resolver.resolve(&query("corp.example", RecordType::Mx), 1));
    assert_eq!(status, ResolveStatus::NotImplemented);
    assert_eq!(message.response_code(), ResponseCode::NotImplemented);
}

#[test]
fn outside_match_domains_goes_to_fallback() {
    let resolver = resolver();
    let Resolution::Fallback(pending) = resolver.resolve(&query("www.example.org", RecordType::A), 3) else {
        panic!("expected fallback");
    };
    assert_eq!(pending.hostname(), "www.example.org");
    let (packet, status) = pending.complete().unwrap();
    assert_eq!(status, ResolveStatus::FallbackAnswer);
    let udp = UdpPacket::parse(packet).unwrap();
    let message = DnsMessage::parse(udp.payload().to_vec()).unwrap();
    assert_eq!(message.response_code(), ResponseCode::NameError);
    let answers = message.answers().unwrap();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].address(), Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
}

#[test]
fn failed_fallback_is_plain_name_error() {
    let resolver = resolver_with(&config(), None);
    let Resolution::Fallback(pending) = resolver.resolve(&query("www.example.org", RecordType::A), 3) else {
        panic!("expected fallback");
    };
    let (packet, status) = pending.complete().unwrap();
    assert_eq!(status, ResolveStatus::NameError);
    let message = DnsMessage::parse(UdpPacket::parse(packet).unwrap().payload().to_vec()).unwrap();
    assert_eq!(message.answer_count(), 0);
}

#[test]
fn responses_and_garbage_are_ignored() {
    let resolver = resolver();
    let mut response = DnsMessage::query(1, "api.corp.example", RecordType::A).unwrap();
    response.set_response(true);
    assert!(matches!(resolver.resolve(&query_packet(&response), 1), Resolution::Ignored));

    let mut garbage = query("api.corp.example", RecordType::A);
    garbage.set_payload(&[1, 2, 3]);
    assert!(matches!(resolver.resolve(&garbage, 1), Resolution::Ignored));
}

#[test]
fn suffix_match_requires_label_boundary() {
    let matcher = DomainMatcher::new("Corp.Example.");
    assert!(matcher.matches("corp.example"));
    assert!(matcher.matches("a.b.corp.example"));
    assert!(!matcher.matches("evilcorp.example"));

    let pattern = DomainMatcher::new("*.lab.test");
    assert!(pattern.matches("node.lab.test"));
    assert!(!pattern.matches("lab.test"));
}

#[test]
fn entries_table_merges_owners() {
    let mut entries = DnsEntries::default();
    let address = Ipv4Addr::new(10, 0, 0, 5);
    assert_eq!(entries.add("Host.Test.", address, "a"), address);
    assert_eq!(entries.add("host.test", Ipv4Addr::new(10, 0, 0, 6), "b"), address);
    entries.add("host.test", address, "b");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries.find("HOST.test").unwrap().service_ids, vec!["a", "b"]);
    assert!(entries.remove_service("a").is_empty());
    assert_eq!(entries.remove_service("b"), vec!["host.test"]);
    assert!(entries.is_empty());
}
