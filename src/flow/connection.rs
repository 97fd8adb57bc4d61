//! Server-side TCP endpoint for one intercepted connection.
//!
//! Segments from the client are applied synchronously by the router through
//! `handle_segment`. Bytes from the overlay arrive on a channel and are turned
//! into segments by a per-flow tokio task, which is the only place that waits
//! on the peer window.

use super::overlay::{DataCallback, DialTarget, OverlayConnection, OverlayError};
use super::regulator::{Admission, TransferRegulator};
use super::{FlowKey, TcpState};
use crate::context::EngineContext;
use crate::error::BridgeError;
use crate::logger::{BreadcrumbFlags, ErrorCategory};
use crate::packet::{TcpFlags, TcpOption, TcpOptions, TcpPacket};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How long a flow stays in TIME_WAIT before the router may reclaim it.
pub const TIME_WAIT_LINGER: Duration = Duration::from_secs(2);

const ADVERTISED_WINDOW: u16 = 0xffff;
const ADVERTISED_WINDOW_SCALE: u8 = 7;

enum OverlayEvent {
    Data(Vec<u8>),
    Eof,
}

/// State after a segment was applied. `halt` asks the owner to drop the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOutcome {
    pub state: TcpState,
    pub halt: bool,
}

struct FlowState {
    phase: TcpState,
    overlay: Option<Arc<dyn OverlayConnection>>,
    /// Sequence number of the next byte we send.
    send_next: u32,
    /// Next sequence number expected from the client; our ACK number.
    recv_next: u32,
    peer_scale: u8,
    peer_mss: Option<u16>,
    time_wait_since: Option<Instant>,
}

pub struct TcpFlow {
    key: FlowKey,
    target: DialTarget,
    context: Arc<EngineContext>,
    state: Mutex<FlowState>,
    regulator: TransferRegulator,
    finished: AtomicBool,
    bytes_from_client: AtomicU64,
    bytes_to_client: AtomicU64,
}

impl TcpFlow {
    pub fn new(context: Arc<EngineContext>, target: DialTarget) -> Arc<Self> {
        let regulator = TransferRegulator::new(
            context.config.flow_control_timeout,
            context.config.flow_control_policy,
        );
        Arc::new(Self {
            key: target.key,
            target,
            context,
            state: Mutex::new(FlowState {
                phase: TcpState::Listen,
                overlay: None,
                send_next: 0,
                recv_next: 0,
                peer_scale: 0,
                peer_mss: None,
                time_wait_since: None,
            }),
            regulator,
            finished: AtomicBool::new(false),
            bytes_from_client: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        })
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn state(&self) -> TcpState {
        self.state.lock().phase
    }

    pub fn regulator(&self) -> &TransferRegulator {
        &self.regulator
    }

    /// Payload bytes written to the overlay.
    pub fn bytes_from_client(&self) -> u64 {
        self.bytes_from_client.load(Ordering::Relaxed)
    }

    /// Payload bytes sent to the client.
    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client.load(Ordering::Relaxed)
    }

    /// True once the flow can leave the table: torn down, or lingered long
    /// enough in TIME_WAIT.
    pub fn is_reclaimable(&self) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return true;
        }
        self.state
            .lock()
            .time_wait_since
            .is_some_and(|since| since.elapsed() >= TIME_WAIT_LINGER)
    }

    /// Applies one client segment.
    pub fn handle_segment(self: &Arc<Self>, segment: &TcpPacket) -> SegmentOutcome {
        let mut state = self.state.lock();
        if self.finished.load(Ordering::Acquire) {
            return SegmentOutcome {
                state: state.phase,
                halt: true,
            };
        }

        let mut halt = false;
        if let Err(err) = self.process(&mut state, segment) {
            match &err {
                BridgeError::FlowDialFailure(_) | BridgeError::Overlay(_) => {
                    self.context
                        .logger
                        .rate_limited_error(ErrorCategory::OverlayError, err.to_string());
                }
                _ => self.context.logger.warn(err.to_string()),
            }
            if matches!(err, BridgeError::Overlay(_)) {
                self.transmit(&mut state, TcpFlags::RST | TcpFlags::ACK, &[]);
                self.set_phase(&mut state, TcpState::Closed);
            }
            halt = true;
        }
        if state.phase == TcpState::Listen && state.overlay.is_none() {
            // reset during the handshake; nothing is left to keep
            halt = true;
        }
        if state.phase == TcpState::Closed {
            halt = true;
        }
        if halt {
            self.teardown(&mut state);
        }
        SegmentOutcome {
            state: state.phase,
            halt,
        }
    }

    /// Tears the flow down from outside the segment path. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        self.teardown(&mut state);
    }

    fn process(self: &Arc<Self>, state: &mut FlowState, segment: &TcpPacket) -> Result<(), BridgeError> {
        let ack = segment.ack().then(|| segment.acknowledgment_number());
        self.regulator.record_peer(segment.window(), ack);

        let pure_ack = segment.ack() && !segment.syn() && !segment.fin() && !segment.rst();
        match state.phase {
            TcpState::Listen if segment.syn() && !segment.ack() && !segment.rst() => {
                self.accept(state, segment)
            }
            TcpState::SynReceived if segment.rst() => {
                self.release_overlay(state);
                self.set_phase(state, TcpState::Listen);
                Ok(())
            }
            TcpState::SynReceived if segment.ack() => {
                self.set_phase(state, TcpState::Established);
                self.regulator
                    .start(state.send_next, state.peer_scale, segment.window());
                if segment.payload().is_empty() && !segment.fin() {
                    Ok(())
                } else {
                    self.established(state, segment)
                }
            }
            TcpState::Established => self.established(state, segment),
            TcpState::LastAck if segment.ack() => {
                self.set_phase(state, TcpState::Closed);
                Ok(())
            }
            TcpState::FinWait1 if !segment.rst() && !segment.syn() => {
                let in_order = self.absorb_payload(state, segment)?;
                if segment.fin() && in_order {
                    state.recv_next = state.recv_next.wrapping_add(1);
                    let next = if segment.ack() {
                        TcpState::TimeWait
                    } else {
                        TcpState::Closing
                    };
                    self.set_phase(state, next);
                    self.transmit(state, TcpFlags::ACK, &[]);
                } else if segment.ack() {
                    self.set_phase(state, TcpState::FinWait2);
                }
                Ok(())
            }
            TcpState::FinWait2 if segment.fin() && !segment.rst() => {
                if self.absorb_payload(state, segment)? {
                    state.recv_next = state.recv_next.wrapping_add(1);
                    self.set_phase(state, TcpState::TimeWait);
                    self.transmit(state, TcpFlags::ACK, &[]);
                }
                Ok(())
            }
            TcpState::FinWait2 if pure_ack => self.absorb_payload(state, segment).map(|_| ()),
            TcpState::Closing if segment.ack() && !segment.rst() => {
                self.set_phase(state, TcpState::TimeWait);
                Ok(())
            }
            TcpState::TimeWait if segment.fin() && !segment.rst() => {
                self.transmit(state, TcpFlags::ACK, &[]);
                Ok(())
            }
            TcpState::TimeWait | TcpState::Closing if pure_ack => Ok(()),
            phase => Err(BridgeError::FlowProtocolViolation {
                flow: self.key,
                detail: format!("unexpected [{}] in {phase}", segment.flags()),
            }),
        }
    }

    /// LISTEN + SYN: dial the overlay and answer with SYN/ACK, or RST/ACK when
    /// the overlay is unreachable.
    fn accept(self: &Arc<Self>, state: &mut FlowState, segment: &TcpPacket) -> Result<(), BridgeError> {
        state.recv_next = segment.sequence_number().wrapping_add(1);
        let options = segment.options().unwrap_or_default();
        state.peer_scale = if segment.option_bytes().is_empty() {
            1
        } else {
            options.window_scale().unwrap_or(0)
        };
        state.peer_mss = options.max_segment_size();

        let Some(overlay) = self.dial() else {
            self.transmit(state, TcpFlags::RST | TcpFlags::ACK, &[]);
            self.set_phase(state, TcpState::Closed);
            return Err(BridgeError::FlowDialFailure(self.key));
        };
        state.overlay = Some(overlay);
        state.send_next = rand::random();

        let syn_options: TcpOptions = [
            TcpOption::MaxSegmentSize(self.context.config.mss()),
            TcpOption::NoOperation,
            TcpOption::WindowScale(ADVERTISED_WINDOW_SCALE),
        ]
        .into_iter()
        .collect();
        self.transmit_with_options(state, TcpFlags::SYN | TcpFlags::ACK, &syn_options);
        self.set_phase(state, TcpState::SynReceived);
        Ok(())
    }

    fn dial(self: &Arc<Self>) -> Option<Arc<dyn OverlayConnection>> {
        let overlay = self.context.dialer.open(&self.target)?;
        let (events, receiver) = mpsc::unbounded_channel();
        let on_data: DataCallback = Box::new(move |data: Option<&[u8]>| {
            let event = match data {
                Some(bytes) if !bytes.is_empty() => OverlayEvent::Data(bytes.to_vec()),
                _ => OverlayEvent::Eof,
            };
            let _ = events.send(event);
        });
        if !overlay.connect(on_data) {
            return None;
        }
        self.context
            .runtime
            .spawn(Arc::clone(self).pump_overlay(receiver));
        Some(overlay)
    }

    fn established(&self, state: &mut FlowState, segment: &TcpPacket) -> Result<(), BridgeError> {
        if segment.rst() || segment.syn() {
            return Err(BridgeError::FlowProtocolViolation {
                flow: self.key,
                detail: format!("[{}] on an established flow", segment.flags()),
            });
        }
        let in_order = self.absorb_payload(state, segment)?;
        if segment.fin() && in_order {
            state.recv_next = state.recv_next.wrapping_add(1);
            self.set_phase(state, TcpState::CloseWait);
            self.transmit(state, TcpFlags::ACK, &[]);
            self.set_phase(state, TcpState::LastAck);
            self.transmit(state, TcpFlags::FIN | TcpFlags::ACK, &[]);
            self.release_overlay(state);
            self.regulator.close();
        }
        Ok(())
    }

    /// Acknowledges in-order data and writes it to the overlay. Returns
    /// whether the segment started at the expected sequence number; anything
    /// else is re-acknowledged and otherwise ignored.
    fn absorb_payload(&self, state: &mut FlowState, segment: &TcpPacket) -> Result<bool, BridgeError> {
        let payload = segment.payload();
        if segment.sequence_number() != state.recv_next {
            if !payload.is_empty() || segment.fin() {
                self.transmit(state, TcpFlags::ACK, &[]);
            }
            return Ok(false);
        }
        if payload.is_empty() {
            return Ok(true);
        }

        state.recv_next = state.recv_next.wrapping_add(payload.len() as u32);
        self.transmit(state, TcpFlags::ACK, &[]);
        let overlay = state.overlay.clone().ok_or(OverlayError::Closed)?;
        let written = overlay.write(payload)?;
        if written != payload.len() {
            return Err(OverlayError::ShortWrite {
                written,
                expected: payload.len(),
            }
            .into());
        }
        self.bytes_from_client
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(true)
    }

    async fn pump_overlay(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<OverlayEvent>) {
        if !self.regulator.wait_open().await {
            return;
        }
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.regulator.wait_closed() => return,
            };
            match event {
                Some(OverlayEvent::Data(bytes)) => {
                    if !self.deliver(&bytes).await {
                        return;
                    }
                }
                Some(OverlayEvent::Eof) | None => {
                    self.finish_from_overlay();
                    return;
                }
            }
        }
    }

    /// Sends overlay bytes to the client in MSS-sized segments, waiting on
    /// the peer window before each one.
    async fn deliver(&self, bytes: &[u8]) -> bool {
        let segment_size = self.segment_size();
        for chunk in bytes.chunks(segment_size) {
            match self.regulator.acquire(chunk.len()).await {
                Admission::Send => {}
                Admission::Proceed => {
                    self.context.logger.rate_limited_error(
                        ErrorCategory::FlowControl,
                        format!("{}, sending anyway", BridgeError::FlowControlTimeout(self.key)),
                    );
                }
                Admission::Drop => {
                    self.reset(BridgeError::FlowControlTimeout(self.key));
                    return false;
                }
                Admission::Closed => return false,
            }

            let mut state = self.state.lock();
            if !matches!(state.phase, TcpState::Established | TcpState::CloseWait) {
                return false;
            }
            self.transmit(&mut state, TcpFlags::ACK, chunk);
            self.bytes_to_client
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        true
    }

    fn segment_size(&self) -> usize {
        let local = self.context.config.mss();
        let peer = self.state.lock().peer_mss.unwrap_or(u16::MAX);
        usize::from(local.min(peer)).max(1)
    }

    /// Overlay end of stream: our side closes first.
    fn finish_from_overlay(&self) {
        let mut state = self.state.lock();
        if state.phase != TcpState::Established {
            return;
        }
        self.transmit(&mut state, TcpFlags::FIN | TcpFlags::ACK, &[]);
        self.set_phase(&mut state, TcpState::FinWait1);
    }

    fn reset(&self, reason: BridgeError) {
        let mut state = self.state.lock();
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        self.context
            .logger
            .rate_limited_error(ErrorCategory::FlowControl, format!("{reason}, resetting"));
        self.transmit(&mut state, TcpFlags::RST | TcpFlags::ACK, &[]);
        self.set_phase(&mut state, TcpState::Closed);
        self.teardown(&mut state);
    }

    fn teardown(&self, state: &mut FlowState) {
        self.release_overlay(state);
        self.regulator.close();
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.context
                .logger
                .breadcrumb_with(BreadcrumbFlags::FLOW, || format!("{} released in {}", self.key, state.phase));
        }
    }

    fn release_overlay(&self, state: &mut FlowState) {
        if let Some(overlay) = state.overlay.take() {
            overlay.close();
        }
    }

    fn set_phase(&self, state: &mut FlowState, next: TcpState) {
        if state.phase == next {
            return;
        }
        self.context.logger.breadcrumb_with(BreadcrumbFlags::FLOW, || {
            format!("{} from {} to {}", self.key, state.phase, next)
        });
        state.phase = next;
        if next == TcpState::TimeWait {
            state.time_wait_since = Some(Instant::now());
            self.release_overlay(state);
            self.regulator.close();
        }
    }

    fn transmit(&self, state: &mut FlowState, flags: TcpFlags, payload: &[u8]) {
        self.emit(state, flags, payload, None);
    }

    fn transmit_with_options(&self, state: &mut FlowState, flags: TcpFlags, options: &TcpOptions) {
        self.emit(state, flags, &[], Some(options));
    }

    /// Builds a segment toward the client from the current sequence state,
    /// queues it on the interface and advances the send edge.
    fn emit(&self, state: &mut FlowState, flags: TcpFlags, payload: &[u8], options: Option<&TcpOptions>) {
        let identification = self.context.next_identification();
        let mut segment = match TcpPacket::build(self.key.destination, self.key.source, identification) {
            Ok(segment) => segment,
            Err(err) => {
                self.context
                    .logger
                    .error(format!("{} cannot build segment: {err}", self.key));
                return;
            }
        };
        segment.set_sequence_number(state.send_next);
        if flags.contains(TcpFlags::ACK) {
            segment.set_acknowledgment_number(state.recv_next);
        }
        segment.set_flags(flags);
        segment.set_window(ADVERTISED_WINDOW);
        if let Some(options) = options {
            if let Err(err) = segment.set_options(options) {
                self.context
                    .logger
                    .error(format!("{} cannot encode options: {err}", self.key));
            }
        }
        segment.set_payload(payload);
        segment.update_lengths_and_checksums();

        state.send_next = state.send_next.wrapping_add(segment.segment_len());
        self.regulator.record_sent(state.send_next);
        self.context
            .logger
            .breadcrumb_with(BreadcrumbFlags::PACKET, || format!("{} send {segment}", self.key));
        self.context.interface.push_outbound(segment.into_ip());
    }
}

impl Drop for TcpFlow {
    fn drop(&mut self) {
        if let Some(overlay) = self.state.get_mut().overlay.take() {
            overlay.close();
        }
    }
}
