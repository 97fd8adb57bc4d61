use super::{parse_response, DnsMessage, RecordType, ResolveError, ResolveOutcome, Resolver};
use super::{ResponseCode, DNS_PORT};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);
const MAX_HOST_LENGTH: usize = 255;
const MAX_RESPONSE_LEN: usize = 4096;

#[derive(Debug)]
struct UpstreamServer {
    address: SocketAddr,
    last_failure: Option<Instant>,
}

/// Forwards A queries over UDP to a fixed list of servers. Each lookup starts
/// with the server whose last failure is the oldest; servers that never
/// failed come first, in configuration order.
#[derive(Debug)]
pub struct UpstreamResolver {
    servers: Mutex<Vec<UpstreamServer>>,
    timeout: Duration,
    next_id: AtomicU16,
}

impl UpstreamResolver {
    pub fn new(servers: &[IpAddr], timeout: Duration) -> Self {
        let servers = servers
            .iter()
            .map(|ip| UpstreamServer {
                address: SocketAddr::new(*ip, DNS_PORT),
                last_failure: None,
            })
            .collect();
        Self::with_addresses(servers, timeout)
    }

    fn with_addresses(servers: Vec<UpstreamServer>, timeout: Duration) -> Self {
        Self {
            servers: Mutex::new(servers),
            timeout: timeout.max(Duration::from_millis(10)),
            next_id: AtomicU16::new(rand::random()),
        }
    }

    /// Servers in the order they should be tried.
    pub fn server_order(&self) -> Vec<SocketAddr> {
        let servers = self.servers.lock();
        let mut indices: Vec<usize> = (0..servers.len()).collect();
        // stable: ties keep configuration order
        indices.sort_by_key(|index| servers[*index].last_failure);
        indices
            .into_iter()
            .map(|index| servers[index].address)
            .collect()
    }

    fn record_failure(&self, address: SocketAddr) {
        let mut servers = self.servers.lock();
        if let Some(server) = servers.iter_mut().find(|server| server.address == address) {
            server.last_failure = Some(Instant::now());
        }
    }

    fn exchange(&self, server: SocketAddr, query: &DnsMessage) -> Result<DnsMessage, ResolveError> {
        let bind: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let io = |error: std::io::Error| ResolveError::LookupFailed(format!("{server}: {error}"));
        let socket = UdpSocket::bind(bind).map_err(io)?;
        socket.set_read_timeout(Some(self.timeout)).map_err(io)?;
        socket.send_to(query.as_bytes(), server).map_err(io)?;

        let deadline = Instant::now() + self.timeout;
        let mut buffer = vec![0u8; MAX_RESPONSE_LEN];
        loop {
            let (len, from) = socket.recv_from(&mut buffer).map_err(io)?;
            if from != server {
                continue;
            }
            match DnsMessage::parse(buffer[..len].to_vec()) {
                Ok(response) if response.is_response() && response.id() == query.id() => {
                    return Ok(response)
                }
                _ if Instant::now() >= deadline => {
                    return Err(ResolveError::LookupFailed(format!(
                        "{server}: no matching response"
                    )))
                }
                _ => continue,
            }
        }
    }
}

impl Resolver for UpstreamResolver {
    fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError> {
        let trimmed = host.trim().trim_end_matches('.');
        if trimmed.is_empty() || trimmed.len() > MAX_HOST_LENGTH {
            return Err(ResolveError::Unsupported);
        }
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(ResolveOutcome {
                addresses: vec![ip],
                ttl: Duration::ZERO,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let query = DnsMessage::query(id, trimmed, RecordType::A)
            .map_err(|_| ResolveError::Unsupported)?;

        let mut last_error = ResolveError::LookupFailed("no upstream servers".into());
        for server in self.server_order() {
            let response = match self.exchange(server, &query) {
                Ok(response) => response,
                Err(error) => {
                    self.record_failure(server);
                    last_error = error;
                    continue;
                }
            };
            if response.response_code() != ResponseCode::NoError {
                // an authoritative negative answer is not a server failure
                return Err(ResolveError::LookupFailed(format!(
                    "{server}: {:?}",
                    response.response_code()
                )));
            }
            let wanted = trimmed.to_ascii_lowercase();
            let mapping = parse_response(&response)
                .into_iter()
                .find(|mapping| mapping.host == wanted);
            return match mapping {
                Some(mapping) if !mapping.addresses.is_empty() => Ok(ResolveOutcome {
                    addresses: mapping.addresses,
                    ttl: Duration::from_secs(u64::from(mapping.ttl.unwrap_or(0))),
                }),
                _ => Err(ResolveError::LookupFailed(format!(
                    "{server}: no addresses for {trimmed}"
                ))),
            };
        }
        Err(last_error)
    }
}
