//! Classifies frames from the interface and hands them to the DNS resolver
//! or the TCP flow that owns them. Everything else is dropped and counted.

use crate::context::EngineContext;
use crate::error::BridgeError;
use crate::flow::{DialTarget, FlowKey, TcpFlow, TcpState};
use crate::logger::{BreadcrumbFlags, ErrorCategory};
use crate::packet::{IpHeader, IpPacket, IpProtocol, ParseError, TcpPacket, UdpPacket};
use crate::resolver::{DnsResolver, Resolution, ResolveStatus};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct RouterCounters {
    invalid_ip_packets: AtomicU64,
    invalid_tcp_packets: AtomicU64,
    invalid_udp_packets: AtomicU64,
    dropped_packets: AtomicU64,
    flows_admitted: AtomicU64,
    flows_closed: AtomicU64,
    dns_answered: AtomicU64,
    dns_fallbacks: AtomicU64,
}

impl RouterCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the router counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub invalid_ip_packets: u64,
    pub invalid_tcp_packets: u64,
    pub invalid_udp_packets: u64,
    pub dropped_packets: u64,
    pub flows_admitted: u64,
    pub flows_closed: u64,
    pub active_flows: u64,
    pub dns_answered: u64,
    pub dns_fallbacks: u64,
}

pub struct PacketRouter {
    context: Arc<EngineContext>,
    resolver: Arc<DnsResolver>,
    flows: Mutex<FxHashMap<FlowKey, Arc<TcpFlow>>>,
    counters: Arc<RouterCounters>,
}

impl PacketRouter {
    pub fn new(context: Arc<EngineContext>, resolver: Arc<DnsResolver>) -> Self {
        Self {
            context,
            resolver,
            flows: Mutex::new(FxHashMap::default()),
            counters: Arc::new(RouterCounters::default()),
        }
    }

    pub fn resolver(&self) -> &Arc<DnsResolver> {
        &self.resolver
    }

    pub fn flow_count(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn flow_state(&self, key: &FlowKey) -> Option<TcpState> {
        let flow = self.flows.lock().get(key).cloned();
        flow.map(|flow| flow.state())
    }

    /// Routes one frame received from the interface.
    pub fn route(&self, frame: Vec<u8>) {
        let packet = match IpPacket::parse(frame) {
            Ok(packet) => packet,
            Err(err) => {
                self.reject(&err);
                return;
            }
        };

        if let IpPacket::V4(v4) = &packet {
            let destination = v4.destination_v4();
            if !self.context.config.subnet_contains(destination)
                && !self.context.config.is_dns_address(IpAddr::V4(destination))
            {
                // broadcast and multicast noise from the host
                self.drop_packet(|| format!("{destination} is outside the tunnel subnet"));
                return;
            }
        }

        match packet.protocol() {
            IpProtocol::Udp => self.route_udp(packet),
            IpProtocol::Tcp => self.route_tcp(packet),
            other => {
                let reason = BridgeError::UnsupportedProtocol(other);
                self.drop_packet(|| reason.to_string());
            }
        }
    }

    fn route_udp(&self, packet: IpPacket) {
        let udp = match UdpPacket::parse(packet) {
            Ok(udp) => udp,
            Err(err) => {
                self.reject(&err);
                return;
            }
        };
        if !self.resolver.needs_resolution(&udp) {
            self.drop_packet(|| {
                format!("UDP to {}:{} is not intercepted", udp.ip().destination(), udp.destination_port())
            });
            return;
        }

        match self.resolver.resolve(&udp, self.context.next_identification()) {
            Resolution::Reply { packet, status } => {
                RouterCounters::bump(&self.counters.dns_answered);
                self.context
                    .logger
                    .breadcrumb_with(BreadcrumbFlags::DNS, || format!("<--DNS {status:?}"));
                self.context.interface.push_outbound(packet);
            }
            Resolution::Fallback(pending) => {
                RouterCounters::bump(&self.counters.dns_fallbacks);
                let interface = self.context.interface.clone();
                let logger = self.context.logger.clone();
                let counters = Arc::clone(&self.counters);
                self.context.runtime.spawn_blocking(move || {
                    let hostname = pending.hostname().to_string();
                    if let Some((packet, status)) = pending.complete() {
                        logger.breadcrumb_with(BreadcrumbFlags::DNS, || {
                            let verdict = if status == ResolveStatus::FallbackAnswer {
                                "resolved"
                            } else {
                                "unresolved"
                            };
                            format!("fallback {verdict} {hostname}")
                        });
                        RouterCounters::bump(&counters.dns_answered);
                        interface.push_outbound(packet);
                    }
                });
            }
            Resolution::Ignored => self.drop_packet(|| "DNS datagram ignored".to_string()),
        }
    }

    fn route_tcp(&self, packet: IpPacket) {
        let segment = match TcpPacket::parse(packet) {
            Ok(segment) => segment,
            Err(err) => {
                self.reject(&err);
                return;
            }
        };
        let key = FlowKey::tcp(segment.source(), segment.destination());
        let existing = self.flows.lock().get(&key).cloned();
        let flow = match existing {
            Some(flow) => flow,
            None if segment.syn() && !segment.ack() => {
                let flow = TcpFlow::new(Arc::clone(&self.context), self.dial_target(key));
                self.flows.lock().insert(key, Arc::clone(&flow));
                RouterCounters::bump(&self.counters.flows_admitted);
                self.context
                    .logger
                    .breadcrumb_with(BreadcrumbFlags::ROUTER, || format!("accepted {key}"));
                flow
            }
            None => {
                self.drop_packet(|| format!("[{}] for unknown flow {key}", segment.flags()));
                return;
            }
        };

        let outcome = flow.handle_segment(&segment);
        if outcome.halt {
            self.remove_flow(&key, &flow);
        }
    }

    fn dial_target(&self, key: FlowKey) -> DialTarget {
        let entries = self.resolver.find_by_ip(key.destination.ip());
        DialTarget {
            key,
            hostname: entries.first().map(|entry| entry.hostname.clone()),
            service_ids: entries
                .into_iter()
                .flat_map(|entry| entry.service_ids)
                .collect(),
        }
    }

    fn remove_flow(&self, key: &FlowKey, flow: &Arc<TcpFlow>) {
        flow.shutdown();
        let mut flows = self.flows.lock();
        if flows.get(key).is_some_and(|current| Arc::ptr_eq(current, flow)) {
            flows.remove(key);
            drop(flows);
            RouterCounters::bump(&self.counters.flows_closed);
            self.context
                .logger
                .breadcrumb_with(BreadcrumbFlags::ROUTER, || format!("removed {key}"));
        }
    }

    /// Removes flows that finished outside the segment path (overlay EOF
    /// followed by TIME_WAIT, flow-control resets). Returns how many left.
    pub fn prune(&self) -> usize {
        let finished: Vec<(FlowKey, Arc<TcpFlow>)> = self
            .flows
            .lock()
            .iter()
            .filter(|(_, flow)| flow.is_reclaimable())
            .map(|(key, flow)| (*key, Arc::clone(flow)))
            .collect();
        for (key, flow) in &finished {
            self.remove_flow(key, flow);
        }
        finished.len()
    }

    /// Tears down every flow.
    pub fn shutdown(&self) {
        let flows: Vec<Arc<TcpFlow>> = self.flows.lock().drain().map(|(_, flow)| flow).collect();
        for flow in &flows {
            flow.shutdown();
        }
        self.counters
            .flows_closed
            .fetch_add(flows.len() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RouterStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RouterStats {
            invalid_ip_packets: load(&self.counters.invalid_ip_packets),
            invalid_tcp_packets: load(&self.counters.invalid_tcp_packets),
            invalid_udp_packets: load(&self.counters.invalid_udp_packets),
            dropped_packets: load(&self.counters.dropped_packets),
            flows_admitted: load(&self.counters.flows_admitted),
            flows_closed: load(&self.counters.flows_closed),
            active_flows: self.flow_count() as u64,
            dns_answered: load(&self.counters.dns_answered),
            dns_fallbacks: load(&self.counters.dns_fallbacks),
        }
    }

    fn reject(&self, err: &ParseError) {
        let (counter, category) = if err.is_tcp_error() {
            (&self.counters.invalid_tcp_packets, ErrorCategory::PacketInvalidTcp)
        } else if err.is_udp_error() {
            (&self.counters.invalid_udp_packets, ErrorCategory::PacketInvalidUdp)
        } else {
            (&self.counters.invalid_ip_packets, ErrorCategory::PacketInvalidIp)
        };
        RouterCounters::bump(counter);
        self.context
            .logger
            .rate_limited_error(category, BridgeError::MalformedPacket(*err).to_string());
    }

    fn drop_packet(&self, reason: impl FnOnce() -> String) {
        RouterCounters::bump(&self.counters.dropped_packets);
        self.context
            .logger
            .breadcrumb_with(BreadcrumbFlags::ROUTER, || format!("drop: {}", reason()));
    }
}

#[cfg(test)]
mod tests;
