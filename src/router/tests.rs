use super::*;
use crate::config::{FlowControlPolicy, TunnelConfig};
use crate::dns::{DnsMessage, RecordType, ResolveError, ResolveOutcome, Resolver, ResponseCode, DNS_PORT};
use crate::packet::{TcpFlags, Ipv4Packet};
use crate::test_support::{RecordingOverlay, TestEngine};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

struct FixedResolver;

impl Resolver for FixedResolver {
    fn resolve(&self, _host: &str) -> Result<ResolveOutcome, ResolveError> {
        Ok(ResolveOutcome {
            addresses: vec![IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))],
            ttl: Duration::from_secs(60),
        })
    }
}

fn router_for(engine: &TestEngine) -> PacketRouter {
    let mut config = engine.context.config.clone();
    config.match_domains = vec!["corp.example".into()];
    let resolver = DnsResolver::new(&config, Arc::new(FixedResolver), engine.context.logger.clone());
    PacketRouter::new(Arc::clone(&engine.context), Arc::new(resolver))
}

fn client() -> SocketAddr {
    "169.254.126.1:51000".parse().unwrap()
}

fn tcp_frame(destination: SocketAddr, flags: TcpFlags, seq: u32, ack: u32) -> Vec<u8> {
    let mut segment = TcpPacket::build(client(), destination, 3).unwrap();
    segment.set_sequence_number(seq);
    segment.set_acknowledgment_number(ack);
    segment.set_flags(flags);
    segment.set_window(0xffff);
    segment.update_lengths_and_checksums();
    segment.into_ip().into_bytes()
}

fn dns_frame(name: &str, destination: Ipv4Addr) -> Vec<u8> {
    let query = DnsMessage::query(0x0a0b, name, RecordType::A).unwrap();
    let mut ip = Ipv4Packet::new(Ipv4Addr::new(169, 254, 126, 1), destination, IpProtocol::Udp, 4);
    let mut datagram = Vec::new();
    datagram.extend_from_slice(&40_000u16.to_be_bytes());
    datagram.extend_from_slice(&DNS_PORT.to_be_bytes());
    datagram.extend_from_slice(&((8 + query.as_bytes().len()) as u16).to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(query.as_bytes());
    ip.set_payload(&datagram);
    ip.update_lengths_and_checksums();
    ip.into_bytes()
}

fn dns_reply(packet: IpPacket) -> DnsMessage {
    let udp = UdpPacket::parse(packet).unwrap();
    DnsMessage::parse(udp.payload().to_vec()).unwrap()
}

#[test]
fn dns_query_is_answered_through_the_interface() {
    let engine = TestEngine::reachable();
    let router = router_for(&engine);
    let address = router.resolver().add_hostname("db.corp.example", "svc").unwrap();

    router.route(dns_frame("db.corp.example", Ipv4Addr::new(169, 254, 126, 2)));
    let sent = engine.outbound();
    assert_eq!(sent.len(), 1);
    let reply = dns_reply(sent.into_iter().next().unwrap());
    assert_eq!(reply.id(), 0x0a0b);
    assert_eq!(reply.answers().unwrap()[0].address(), Some(IpAddr::V4(address)));
    assert_eq!(router.stats().dns_answered, 1);
}

#[test]
fn fallback_answer_arrives_off_the_routing_path() {
    let engine = TestEngine::reachable();
    let router = router_for(&engine);

    router.route(dns_frame("www.example.net", Ipv4Addr::new(169, 254, 126, 2)));
    let sent = engine.wait_outbound(1);
    assert_eq!(sent.len(), 1);
    let reply = dns_reply(sent.into_iter().next().unwrap());
    assert_eq!(reply.response_code(), ResponseCode::NameError);
    assert_eq!(
        reply.answers().unwrap()[0].address(),
        Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)))
    );
    let stats = router.stats();
    assert_eq!(stats.dns_fallbacks, 1);
    assert_eq!(stats.dns_answered, 1);
}

#[test]
fn udp_to_other_ports_is_dropped() {
    let engine = TestEngine::reachable();
    let router = router_for(&engine);
    let mut frame = dns_frame("db.corp.example", Ipv4Addr::new(169, 254, 126, 9));
    // not a DNS address
    router.route(frame.clone());
    // outside the subnet
    frame[16..20].copy_from_slice(&[239, 255, 255, 250]);
    router.route(frame);
    assert!(engine.outbound().is_empty());
    assert_eq!(router.stats().dropped_packets, 2);
}

#[test]
fn syn_creates_flow_and_handshake_completes() {
    let engine = TestEngine::reachable();
    let router = router_for(&engine);
    let address = router.resolver().add_hostname("git.corp.example", "svc-git").unwrap();
    let server = SocketAddr::new(IpAddr::V4(address), 22);

    router.route(tcp_frame(server, TcpFlags::SYN, 10, 0));
    assert_eq!(router.flow_count(), 1);
    let key = FlowKey::tcp(client(), server);
    assert_eq!(router.flow_state(&key), Some(TcpState::SynReceived));

    let dials = engine.dialer.dials.lock().clone();
    assert_eq!(dials[0].hostname.as_deref(), Some("git.corp.example"));
    assert_eq!(dials[0].service_ids, vec!["svc-git"]);

    let syn_ack = engine.sent_segments().remove(0);
    assert_eq!(syn_ack.flags(), TcpFlags::SYN | TcpFlags::ACK);
    let server_isn = syn_ack.sequence_number();
    router.route(tcp_frame(server, TcpFlags::ACK, 11, server_isn.wrapping_add(1)));
    assert_eq!(router.flow_state(&key), Some(TcpState::Established));

    router.route(tcp_frame(server, TcpFlags::FIN | TcpFlags::ACK, 11, server_isn.wrapping_add(1)));
    assert_eq!(router.flow_state(&key), Some(TcpState::LastAck));
    router.route(tcp_frame(server, TcpFlags::ACK, 12, server_isn.wrapping_add(2)));
    assert_eq!(router.flow_count(), 0);
    assert!(engine.overlay.is_closed());

    let stats = router.stats();
    assert_eq!(stats.flows_admitted, 1);
    assert_eq!(stats.flows_closed, 1);
    assert_eq!(stats.active_flows, 0);
}

#[test]
fn dial_failure_leaves_no_flow_behind() {
    let engine = TestEngine::new(TunnelConfig::default(), None);
    let router = router_for(&engine);
    let server: SocketAddr = "169.254.126.40:80".parse().unwrap();

    router.route(tcp_frame(server, TcpFlags::SYN, 1, 0));
    let sent = engine.sent_segments();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags(), TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(router.flow_count(), 0);
}

#[test]
fn segments_for_unknown_flows_are_dropped() {
    let engine = TestEngine::reachable();
    let router = router_for(&engine);
    let server: SocketAddr = "169.254.126.40:80".parse().unwrap();
    router.route(tcp_frame(server, TcpFlags::ACK, 1, 1));
    router.route(tcp_frame(server, TcpFlags::SYN | TcpFlags::ACK, 1, 1));
    assert_eq!(router.flow_count(), 0);
    assert!(engine.outbound().is_empty());
    assert!(engine.dialer.dials.lock().is_empty());
    assert_eq!(router.stats().dropped_packets, 2);
}

#[test]
fn malformed_frames_are_counted_by_layer() {
    let engine = TestEngine::reachable();
    let router = router_for(&engine);

    router.route(vec![0x45, 0x00, 0x00]);
    router.route(vec![0x20; 24]);

    let mut short_tcp = Ipv4Packet::new(
        Ipv4Addr::new(169, 254, 126, 1),
        Ipv4Addr::new(169, 254, 126, 30),
        IpProtocol::Tcp,
        1,
    );
    short_tcp.set_payload(&[0u8; 8]);
    short_tcp.update_lengths_and_checksums();
    router.route(short_tcp.into_bytes());

    let mut short_udp = Ipv4Packet::new(
        Ipv4Addr::new(169, 254, 126, 1),
        Ipv4Addr::new(169, 254, 126, 2),
        IpProtocol::Udp,
        1,
    );
    short_udp.set_payload(&[0u8; 4]);
    short_udp.update_lengths_and_checksums();
    router.route(short_udp.into_bytes());

    let mut icmp = Ipv4Packet::new(
        Ipv4Addr::new(169, 254, 126, 1),
        Ipv4Addr::new(169, 254, 126, 30),
        IpProtocol::Icmp,
        1,
    );
    icmp.set_payload(&[8, 0, 0, 0]);
    icmp.update_lengths_and_checksums();
    router.route(icmp.into_bytes());

    let stats = router.stats();
    assert_eq!(stats.invalid_ip_packets, 2);
    assert_eq!(stats.invalid_tcp_packets, 1);
    assert_eq!(stats.invalid_udp_packets, 1);
    assert_eq!(stats.dropped_packets, 1);
    assert!(engine.outbound().is_empty());
}

#[test]
fn prune_reclaims_flows_reset_by_flow_control() {
    let config = TunnelConfig {
        flow_control_timeout: Duration::from_millis(30),
        flow_control_policy: FlowControlPolicy::Drop,
        ..TunnelConfig::default()
    };
    let engine = TestEngine::new(config, Some(RecordingOverlay::default()));
    let router = router_for(&engine);
    let server: SocketAddr = "169.254.126.50:443".parse().unwrap();

    router.route(tcp_frame(server, TcpFlags::SYN, 100, 0));
    let server_isn = engine.sent_segments()[0].sequence_number();
    let mut zero_window = TcpPacket::parse(IpPacket::parse(tcp_frame(server, TcpFlags::ACK, 101, server_isn.wrapping_add(1))).unwrap()).unwrap();
    zero_window.set_window(0);
    zero_window.update_lengths_and_checksums();
    router.route(zero_window.into_ip().into_bytes());
    assert_eq!(router.prune(), 0);

    engine.overlay.deliver(Some(b"stuck"));
    let sent = engine.wait_segments(1);
    assert!(sent[0].rst());
    assert_eq!(router.prune(), 1);
    assert_eq!(router.flow_count(), 0);
}

#[test]
fn shutdown_releases_every_flow() {
    let engine = TestEngine::reachable();
    let router = router_for(&engine);
    router.route(tcp_frame("169.254.126.60:80".parse().unwrap(), TcpFlags::SYN, 1, 0));
    router.route(tcp_frame("169.254.126.61:80".parse().unwrap(), TcpFlags::SYN, 1, 0));
    assert_eq!(router.flow_count(), 2);
    router.shutdown();
    assert_eq!(router.flow_count(), 0);
    assert!(engine.overlay.is_closed());
    assert_eq!(router.stats().flows_closed, 2);
}
