use super::*;
use crate::config::{FlowControlPolicy, TunnelConfig};
use crate::packet::{TcpFlags, TcpOption, TcpOptions, TcpPacket};
use crate::test_support::{RecordingOverlay, TestEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLIENT_ISN: u32 = 1000;

fn client() -> SocketAddr {
    "169.254.126.1:50000".parse().unwrap()
}

fn server() -> SocketAddr {
    "169.254.126.10:443".parse().unwrap()
}

type Harness = TestEngine;

fn new_flow(harness: &Harness) -> Arc<TcpFlow> {
    TcpFlow::new(
        Arc::clone(&harness.context),
        DialTarget {
            key: FlowKey::tcp(client(), server()),
            hostname: Some("api.example.com".into()),
            service_ids: vec!["svc-1".into()],
        },
    )
}

fn segment(flags: TcpFlags, seq: u32, ack: u32, window: u16, payload: &[u8]) -> TcpPacket {
    let mut packet = TcpPacket::build(client(), server(), 7).unwrap();
    packet.set_sequence_number(seq);
    packet.set_acknowledgment_number(ack);
    packet.set_flags(flags);
    packet.set_window(window);
    packet.set_payload(payload);
    packet.update_lengths_and_checksums();
    packet
}

fn syn_with_options(mss: u16) -> TcpPacket {
    let mut packet = segment(TcpFlags::SYN, CLIENT_ISN, 0, 0xffff, &[]);
    let options: TcpOptions = [
        TcpOption::MaxSegmentSize(mss),
        TcpOption::NoOperation,
        TcpOption::WindowScale(7),
    ]
    .into_iter()
    .collect();
    packet.set_options(&options).unwrap();
    packet.update_lengths_and_checksums();
    packet
}

/// Runs SYN / SYN-ACK / ACK and returns the server's initial sequence number.
fn handshake(harness: &Harness, flow: &Arc<TcpFlow>, syn: TcpPacket) -> u32 {
    let outcome = flow.handle_segment(&syn);
    assert_eq!(outcome.state, TcpState::SynReceived);
    let sent = harness.sent_segments();
    assert_eq!(sent.len(), 1);
    let server_isn = sent[0].sequence_number();
    let ack = segment(TcpFlags::ACK, CLIENT_ISN + 1, server_isn.wrapping_add(1), 0xffff, &[]);
    assert_eq!(flow.handle_segment(&ack).state, TcpState::Established);
    server_isn
}

#[test]
fn full_lifecycle_forwards_data_and_closes() {
    let harness = Harness::reachable();
    let flow = new_flow(&harness);

    let outcome = flow.handle_segment(&syn_with_options(1460));
    assert_eq!(outcome, SegmentOutcome { state: TcpState::SynReceived, halt: false });
    let syn_ack = harness.sent_segments();
    assert_eq!(syn_ack.len(), 1);
    assert_eq!(syn_ack[0].flags(), TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(syn_ack[0].acknowledgment_number(), CLIENT_ISN + 1);
    assert_eq!(syn_ack[0].window(), 0xffff);
    assert_eq!(syn_ack[0].source(), server());
    assert_eq!(syn_ack[0].destination(), client());
    assert!(syn_ack[0].verify_checksum());
    let options = syn_ack[0].options().unwrap();
    assert_eq!(options.max_segment_size(), Some(harness.context.config.mss()));
    assert_eq!(options.window_scale(), Some(7));
    let server_isn = syn_ack[0].sequence_number();

    let dials = harness.dialer.dials.lock().clone();
    assert_eq!(dials.len(), 1);
    assert_eq!(dials[0].hostname.as_deref(), Some("api.example.com"));

    let ack = segment(TcpFlags::ACK, CLIENT_ISN + 1, server_isn.wrapping_add(1), 0xffff, &[]);
    assert_eq!(flow.handle_segment(&ack).state, TcpState::Established);
    assert!(harness.sent_segments().is_empty());

    let data = segment(TcpFlags::ACK | TcpFlags::PSH, CLIENT_ISN + 1, server_isn.wrapping_add(1), 0xffff, b"hello");
    assert_eq!(flow.handle_segment(&data).state, TcpState::Established);
    let acks = harness.sent_segments();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].flags(), TcpFlags::ACK);
    assert_eq!(acks[0].acknowledgment_number(), CLIENT_ISN + 6);
    assert_eq!(harness.overlay.written(), b"hello");
    assert_eq!(flow.bytes_from_client(), 5);

    let fin = segment(TcpFlags::FIN | TcpFlags::ACK, CLIENT_ISN + 6, server_isn.wrapping_add(1), 0xffff, &[]);
    assert_eq!(flow.handle_segment(&fin).state, TcpState::LastAck);
    let closing = harness.sent_segments();
    assert_eq!(closing.len(), 2);
    assert_eq!(closing[0].flags(), TcpFlags::ACK);
    assert_eq!(closing[0].acknowledgment_number(), CLIENT_ISN + 7);
    assert_eq!(closing[1].flags(), TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(closing[1].sequence_number(), server_isn.wrapping_add(1));
    assert!(harness.overlay.is_closed());

    let last_ack = segment(TcpFlags::ACK, CLIENT_ISN + 7, server_isn.wrapping_add(2), 0xffff, &[]);
    let outcome = flow.handle_segment(&last_ack);
    assert_eq!(outcome, SegmentOutcome { state: TcpState::Closed, halt: true });
    assert!(flow.is_reclaimable());
    assert_eq!(flow.bytes_from_client(), 5);
}

#[test]
fn dial_failure_sends_one_reset() {
    let harness = Harness::new(TunnelConfig::default(), None);
    let flow = new_flow(&harness);

    let outcome = flow.handle_segment(&syn_with_options(1460));
    assert_eq!(outcome, SegmentOutcome { state: TcpState::Closed, halt: true });
    let sent = harness.sent_segments();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags(), TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(sent[0].acknowledgment_number(), CLIENT_ISN + 1);
    assert!(sent[0].payload().is_empty());
    assert!(flow.is_reclaimable());
}

#[test]
fn refused_connect_counts_as_dial_failure() {
    let overlay = RecordingOverlay {
        refuse_connect: true,
        ..Default::default()
    };
    let harness = Harness::new(TunnelConfig::default(), Some(overlay));
    let flow = new_flow(&harness);
    assert!(flow.handle_segment(&syn_with_options(1460)).halt);
    let sent = harness.sent_segments();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].rst());
}

#[test]
fn overlay_data_is_chunked_to_peer_mss() {
    let harness = Harness::reachable();
    let flow = new_flow(&harness);
    let server_isn = handshake(&harness, &flow, syn_with_options(100));

    let body: Vec<u8> = (0..250u32).map(|idx| idx as u8).collect();
    harness.overlay.deliver(Some(&body));
    let sent = harness.wait_segments(3);
    assert_eq!(sent.len(), 3);
    let sizes: Vec<usize> = sent.iter().map(|segment| segment.payload().len()).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(sent[0].sequence_number(), server_isn.wrapping_add(1));
    assert_eq!(sent[1].sequence_number(), server_isn.wrapping_add(101));
    assert_eq!(sent[2].sequence_number(), server_isn.wrapping_add(201));
    for segment in &sent {
        assert!(segment.ack());
        assert_eq!(segment.acknowledgment_number(), CLIENT_ISN + 1);
        assert!(segment.verify_checksum());
    }
    let joined: Vec<u8> = sent.iter().flat_map(|segment| segment.payload().to_vec()).collect();
    assert_eq!(joined, body);
    assert_eq!(flow.bytes_to_client(), 250);
}

#[test]
fn overlay_end_of_stream_closes_from_our_side() {
    let harness = Harness::reachable();
    let flow = new_flow(&harness);
    let server_isn = handshake(&harness, &flow, syn_with_options(1460));

    harness.overlay.deliver(None);
    let sent = harness.wait_segments(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags(), TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(flow.state(), TcpState::FinWait1);

    let ack = segment(TcpFlags::ACK, CLIENT_ISN + 1, server_isn.wrapping_add(2), 0xffff, &[]);
    assert_eq!(flow.handle_segment(&ack).state, TcpState::FinWait2);

    let fin = segment(TcpFlags::FIN | TcpFlags::ACK, CLIENT_ISN + 1, server_isn.wrapping_add(2), 0xffff, &[]);
    let outcome = flow.handle_segment(&fin);
    assert_eq!(outcome, SegmentOutcome { state: TcpState::TimeWait, halt: false });
    let sent = harness.sent_segments();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags(), TcpFlags::ACK);
    assert_eq!(sent[0].acknowledgment_number(), CLIENT_ISN + 2);
    assert!(harness.overlay.is_closed());
    assert!(!flow.is_reclaimable());

    // a retransmitted FIN is acknowledged again
    flow.handle_segment(&fin);
    assert_eq!(harness.sent_segments().len(), 1);
}

#[test]
fn simultaneous_close_passes_through_closing() {
    let harness = Harness::reachable();
    let flow = new_flow(&harness);
    let server_isn = handshake(&harness, &flow, syn_with_options(1460));
    harness.overlay.deliver(Some(&[]));
    assert_eq!(harness.wait_segments(1).len(), 1);

    let fin = segment(TcpFlags::FIN, CLIENT_ISN + 1, 0, 0xffff, &[]);
    assert_eq!(flow.handle_segment(&fin).state, TcpState::Closing);
    let ack = segment(TcpFlags::ACK, CLIENT_ISN + 2, server_isn.wrapping_add(2), 0xffff, &[]);
    assert_eq!(flow.handle_segment(&ack).state, TcpState::TimeWait);
}

#[test]
fn overlay_write_failure_aborts_flow() {
    let overlay = RecordingOverlay {
        fail_writes: true,
        ..Default::default()
    };
    let harness = Harness::new(TunnelConfig::default(), Some(overlay));
    let flow = new_flow(&harness);
    let server_isn = handshake(&harness, &flow, syn_with_options(1460));

    let data = segment(TcpFlags::ACK, CLIENT_ISN + 1, server_isn.wrapping_add(1), 0xffff, b"payload");
    let outcome = flow.handle_segment(&data);
    assert_eq!(outcome, SegmentOutcome { state: TcpState::Closed, halt: true });
    let sent = harness.sent_segments();
    assert!(sent.last().unwrap().rst());
    assert!(harness.overlay.is_closed());
}

#[test]
fn out_of_order_data_is_reacknowledged_not_written() {
    let harness = Harness::reachable();
    let flow = new_flow(&harness);
    let server_isn = handshake(&harness, &flow, syn_with_options(1460));

    let ahead = segment(TcpFlags::ACK, CLIENT_ISN + 50, server_isn.wrapping_add(1), 0xffff, b"late");
    assert_eq!(flow.handle_segment(&ahead).state, TcpState::Established);
    let sent = harness.sent_segments();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].acknowledgment_number(), CLIENT_ISN + 1);
    assert!(harness.overlay.written().is_empty());
}

#[test]
fn reset_during_handshake_releases_flow() {
    let harness = Harness::reachable();
    let flow = new_flow(&harness);
    flow.handle_segment(&syn_with_options(1460));
    harness.sent_segments();

    let rst = segment(TcpFlags::RST, CLIENT_ISN + 1, 0, 0, &[]);
    let outcome = flow.handle_segment(&rst);
    assert_eq!(outcome, SegmentOutcome { state: TcpState::Listen, halt: true });
    assert!(harness.overlay.is_closed());
    assert!(harness.sent_segments().is_empty());
}

#[test]
fn unexpected_segment_is_a_protocol_violation() {
    let harness = Harness::reachable();
    let flow = new_flow(&harness);
    let stray = segment(TcpFlags::ACK, CLIENT_ISN, 1, 0xffff, &[]);
    let outcome = flow.handle_segment(&stray);
    assert!(outcome.halt);
    assert!(harness.dialer.dials.lock().is_empty());

    // halted flows ignore everything afterwards
    assert!(flow.handle_segment(&syn_with_options(1460)).halt);
    assert!(harness.sent_segments().is_empty());
}

#[test]
fn shutdown_is_idempotent() {
    let harness = Harness::reachable();
    let flow = new_flow(&harness);
    handshake(&harness, &flow, syn_with_options(1460));
    flow.shutdown();
    flow.shutdown();
    assert!(harness.overlay.is_closed());
    assert!(flow.is_reclaimable());
    assert!(flow.regulator().is_closed());
}

#[test]
fn drop_policy_resets_flow_when_window_stays_closed() {
    let config = TunnelConfig {
        flow_control_timeout: Duration::from_millis(40),
        flow_control_policy: FlowControlPolicy::Drop,
        ..TunnelConfig::default()
    };
    let harness = Harness::new(config, Some(RecordingOverlay::default()));
    let flow = new_flow(&harness);
    let syn = segment(TcpFlags::SYN, CLIENT_ISN, 0, 0xffff, &[]);
    flow.handle_segment(&syn);
    let server_isn = harness.sent_segments()[0].sequence_number();
    let zero_window = segment(TcpFlags::ACK, CLIENT_ISN + 1, server_isn.wrapping_add(1), 0, &[]);
    flow.handle_segment(&zero_window);

    harness.overlay.deliver(Some(b"blocked"));
    let sent = harness.wait_segments(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags(), TcpFlags::RST | TcpFlags::ACK);
    assert!(sent[0].payload().is_empty());
    assert_eq!(flow.state(), TcpState::Closed);
    assert!(flow.is_reclaimable());
}

#[test]
fn proceed_policy_sends_after_timeout() {
    let config = TunnelConfig {
        flow_control_timeout: Duration::from_millis(40),
        ..TunnelConfig::default()
    };
    let harness = Harness::new(config, Some(RecordingOverlay::default()));
    let flow = new_flow(&harness);
    let syn = segment(TcpFlags::SYN, CLIENT_ISN, 0, 0xffff, &[]);
    flow.handle_segment(&syn);
    let server_isn = harness.sent_segments()[0].sequence_number();
    let zero_window = segment(TcpFlags::ACK, CLIENT_ISN + 1, server_isn.wrapping_add(1), 0, &[]);
    flow.handle_segment(&zero_window);

    harness.overlay.deliver(Some(b"late"));
    let sent = harness.wait_segments(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload(), b"late");
    assert_eq!(flow.state(), TcpState::Established);
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
        .block_on(future)
}

#[test]
fn regulator_waits_for_ack_to_open_room() {
    block_on(async {
        let regulator = Arc::new(TransferRegulator::new(
            Duration::from_secs(2),
            FlowControlPolicy::Proceed,
        ));
        regulator.start(5000, 0, 100);
        regulator.record_sent(5100);
        assert_eq!(regulator.outstanding(), 100);

        let waiter = tokio::spawn({
            let regulator = Arc::clone(&regulator);
            async move { regulator.acquire(50).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        regulator.record_peer(100, Some(5060));
        assert_eq!(regulator.outstanding(), 40);
        let admission = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(admission, Admission::Send);
    });
}

#[test]
fn regulator_admits_after_partial_ack() {
    block_on(async {
        let regulator = Arc::new(TransferRegulator::new(
            Duration::from_secs(2),
            FlowControlPolicy::Proceed,
        ));
        regulator.start(5000, 0, 100);
        regulator.record_sent(5100);

        let waiter = tokio::spawn({
            let regulator = Arc::clone(&regulator);
            async move { regulator.acquire(50).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // 90 bytes still outstanding: the window alone would not admit 50
        regulator.record_peer(100, Some(5010));
        assert_eq!(regulator.outstanding(), 90);
        let admission = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(admission, Admission::Send);
    });
}

#[test]
fn regulator_timeout_follows_policy() {
    block_on(async {
        for (policy, expected) in [
            (FlowControlPolicy::Proceed, Admission::Proceed),
            (FlowControlPolicy::Drop, Admission::Drop),
        ] {
            let regulator = TransferRegulator::new(Duration::from_millis(20), policy);
            regulator.start(1, 0, 0);
            let started = Instant::now();
            assert_eq!(regulator.acquire(10).await, expected);
            assert!(started.elapsed() >= Duration::from_millis(20));
        }
    });
}

#[test]
fn regulator_ignores_stale_acks_and_scales_window() {
    let regulator = TransferRegulator::new(Duration::from_millis(10), FlowControlPolicy::Proceed);
    regulator.start(100, 2, 10);
    regulator.record_sent(140);
    // an ACK beyond what was sent is ignored
    regulator.record_peer(10, Some(500));
    assert_eq!(regulator.outstanding(), 40);
    regulator.record_peer(10, Some(120));
    assert_eq!(regulator.outstanding(), 20);
    // an older ACK does not move the edge back
    regulator.record_peer(10, Some(110));
    assert_eq!(regulator.outstanding(), 20);

    block_on(async {
        // 10 << 2 leaves 20 bytes of room
        assert_eq!(regulator.acquire(20).await, Admission::Send);
    });
}

#[test]
fn regulator_close_wakes_waiters() {
    block_on(async {
        let regulator = Arc::new(TransferRegulator::new(
            Duration::from_secs(5),
            FlowControlPolicy::Proceed,
        ));
        regulator.start(1, 0, 0);
        let waiter = tokio::spawn({
            let regulator = Arc::clone(&regulator);
            async move { regulator.acquire(1).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        regulator.close();
        let admission = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(admission, Admission::Closed);
        assert!(!regulator.wait_open().await);
    });
}

#[test]
fn flow_key_display() {
    let key = FlowKey::tcp(client(), server());
    assert_eq!(key.to_string(), "TCP:169.254.126.1:50000->169.254.126.10:443");
    assert_eq!(TcpState::FinWait1.to_string(), "FIN_WAIT_1");
}
