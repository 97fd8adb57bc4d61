//! Tunnel configuration: addressing, DNS interception and flow-control knobs.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

pub const IP_KEY: &str = "ip";
pub const SUBNET_KEY: &str = "subnet";
pub const MTU_KEY: &str = "mtu";
pub const DNS_KEY: &str = "dns";
pub const MATCH_DOMAINS_KEY: &str = "matchDomains";
pub const DNS_PROXIES_KEY: &str = "dnsProxies";
pub const FLOW_CONTROL_TIMEOUT_KEY: &str = "flowControlTimeoutMs";
pub const FLOW_CONTROL_POLICY_KEY: &str = "flowControlPolicy";
pub const RING_CAPACITY_KEY: &str = "ringCapacity";
pub const FALLBACK_KEY: &str = "fallback";

pub const DEFAULT_MTU: usize = 2000;
pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 9000;
pub const DEFAULT_RING_CAPACITY: usize = 512;
pub const DEFAULT_FLOW_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// IPv4 + TCP header bytes subtracted from the MTU for the advertised MSS.
const TCP_IP_OVERHEAD: usize = 40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("subnet mask {0} is not contiguous")]
    NonContiguousMask(Ipv4Addr),
    #[error("at least one DNS address is required")]
    MissingDnsAddress,
}

/// What a sender does when the peer window stays closed past the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControlPolicy {
    /// Send anyway and log it.
    #[default]
    Proceed,
    /// Discard unsent data and reset the flow.
    Drop,
}

impl FlowControlPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowControlPolicy::Proceed => "proceed",
            FlowControlPolicy::Drop => "drop",
        }
    }
}

/// Resolver used for names outside the intercepted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackResolver {
    #[default]
    System,
    Upstream,
}

impl FallbackResolver {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackResolver::System => "system",
            FallbackResolver::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub mtu: usize,
    pub dns_addresses: Vec<IpAddr>,
    pub match_domains: Vec<String>,
    pub dns_proxies: Vec<IpAddr>,
    pub flow_control_timeout: Duration,
    pub flow_control_policy: FlowControlPolicy,
    pub ring_capacity: usize,
    pub fallback: FallbackResolver,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::new(169, 254, 126, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: DEFAULT_MTU,
            dns_addresses: vec![IpAddr::V4(Ipv4Addr::new(169, 254, 126, 2))],
            match_domains: Vec::new(),
            dns_proxies: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
            ],
            flow_control_timeout: DEFAULT_FLOW_CONTROL_TIMEOUT,
            flow_control_policy: FlowControlPolicy::Proceed,
            ring_capacity: DEFAULT_RING_CAPACITY,
            fallback: FallbackResolver::System,
        }
    }
}

impl TunnelConfig {
    /// Builds a config from string values, starting from the defaults for any
    /// key that is absent. List values are comma separated.
    pub fn from_dictionary(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| values.get(key).map(|value| value.trim());

        if let Some(value) = get(IP_KEY) {
            config.ip = parse_value(IP_KEY, value)?;
        }
        if let Some(value) = get(SUBNET_KEY) {
            config.subnet_mask = parse_value(SUBNET_KEY, value)?;
        }
        if let Some(value) = get(MTU_KEY) {
            config.mtu = normalize_mtu(parse_value(MTU_KEY, value)?);
        }
        if let Some(value) = get(DNS_KEY) {
            config.dns_addresses = parse_list(DNS_KEY, value)?;
        }
        if let Some(value) = get(MATCH_DOMAINS_KEY) {
            config.match_domains = split_list(value)
                .map(|domain| domain.trim_end_matches('.').to_ascii_lowercase())
                .collect();
        }
        if let Some(value) = get(DNS_PROXIES_KEY) {
            config.dns_proxies = parse_list(DNS_PROXIES_KEY, value)?;
        }
        if let Some(value) = get(FLOW_CONTROL_TIMEOUT_KEY) {
            let millis: u64 = parse_value(FLOW_CONTROL_TIMEOUT_KEY, value)?;
            config.flow_control_timeout = Duration::from_millis(millis.max(1));
        }
        if let Some(value) = get(FLOW_CONTROL_POLICY_KEY) {
            config.flow_control_policy = match value.to_ascii_lowercase().as_str() {
                "proceed" => FlowControlPolicy::Proceed,
                "drop" => FlowControlPolicy::Drop,
                _ => return Err(invalid(FLOW_CONTROL_POLICY_KEY, value)),
            };
        }
        if let Some(value) = get(RING_CAPACITY_KEY) {
            let capacity: usize = parse_value(RING_CAPACITY_KEY, value)?;
            if capacity == 0 {
                return Err(invalid(RING_CAPACITY_KEY, value));
            }
            config.ring_capacity = capacity;
        }
        if let Some(value) = get(FALLBACK_KEY) {
            config.fallback = match value.to_ascii_lowercase().as_str() {
                "system" => FallbackResolver::System,
                "upstream" => FallbackResolver::Upstream,
                _ => return Err(invalid(FALLBACK_KEY, value)),
            };
        }
        config.validate()?;
        Ok(config)
    }

    pub fn to_dictionary(&self) -> HashMap<String, String> {
        let join = |items: &[IpAddr]| {
            items
                .iter()
                .map(IpAddr::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        HashMap::from([
            (IP_KEY.to_string(), self.ip.to_string()),
            (SUBNET_KEY.to_string(), self.subnet_mask.to_string()),
            (MTU_KEY.to_string(), self.mtu.to_string()),
            (DNS_KEY.to_string(), join(&self.dns_addresses)),
            (MATCH_DOMAINS_KEY.to_string(), self.match_domains.join(",")),
            (DNS_PROXIES_KEY.to_string(), join(&self.dns_proxies)),
            (
                FLOW_CONTROL_TIMEOUT_KEY.to_string(),
                self.flow_control_timeout.as_millis().to_string(),
            ),
            (
                FLOW_CONTROL_POLICY_KEY.to_string(),
                self.flow_control_policy.as_str().to_string(),
            ),
            (RING_CAPACITY_KEY.to_string(), self.ring_capacity.to_string()),
            (FALLBACK_KEY.to_string(), self.fallback.as_str().to_string()),
        ])
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mask = u32::from(self.subnet_mask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(ConfigError::NonContiguousMask(self.subnet_mask));
        }
        if self.dns_addresses.is_empty() {
            return Err(ConfigError::MissingDnsAddress);
        }
        Ok(())
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) & u32::from(self.subnet_mask))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !u32::from(self.subnet_mask))
    }

    pub fn subnet_contains(&self, address: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(address) & mask == u32::from(self.ip) & mask
    }

    /// Maximum segment size advertised on SYN/ACK.
    pub fn mss(&self) -> u16 {
        (self.mtu - TCP_IP_OVERHEAD).min(usize::from(u16::MAX)) as u16
    }

    pub fn is_dns_address(&self, address: IpAddr) -> bool {
        self.dns_addresses.contains(&address)
    }
}

pub fn normalize_mtu(value: usize) -> usize {
    value.clamp(MIN_MTU, MAX_MTU)
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

fn parse_list(key: &'static str, value: &str) -> Result<Vec<IpAddr>, ConfigError> {
    split_list(value).map(|item| parse_value(key, item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dictionary(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_tunnel_layout() {
        let config = TunnelConfig::default();
        assert_eq!(config.network(), Ipv4Addr::new(169, 254, 126, 0));
        assert_eq!(config.broadcast(), Ipv4Addr::new(169, 254, 126, 255));
        assert_eq!(config.mss(), 1960);
        assert!(config.is_dns_address(IpAddr::from([169, 254, 126, 2])));
        assert_eq!(config.flow_control_policy, FlowControlPolicy::Proceed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_dictionary_values() {
        let config = TunnelConfig::from_dictionary(&dictionary(&[
            (IP_KEY, "10.20.0.1"),
            (SUBNET_KEY, "255.255.0.0"),
            (MTU_KEY, "100000"),
            (DNS_KEY, "10.20.0.2, 10.20.0.3"),
            (MATCH_DOMAINS_KEY, "Corp.Example.,*.svc.test,"),
            (DNS_PROXIES_KEY, "9.9.9.9"),
            (FLOW_CONTROL_TIMEOUT_KEY, "250"),
            (FLOW_CONTROL_POLICY_KEY, "Drop"),
            (RING_CAPACITY_KEY, "64"),
            (FALLBACK_KEY, "upstream"),
        ]))
        .unwrap();
        assert_eq!(config.ip, Ipv4Addr::new(10, 20, 0, 1));
        assert_eq!(config.mtu, MAX_MTU);
        assert_eq!(config.dns_addresses.len(), 2);
        assert_eq!(config.match_domains, vec!["corp.example", "*.svc.test"]);
        assert_eq!(config.dns_proxies, vec![IpAddr::from([9, 9, 9, 9])]);
        assert_eq!(config.flow_control_timeout, Duration::from_millis(250));
        assert_eq!(config.flow_control_policy, FlowControlPolicy::Drop);
        assert_eq!(config.ring_capacity, 64);
        assert_eq!(config.fallback, FallbackResolver::Upstream);
        assert!(config.subnet_contains(Ipv4Addr::new(10, 20, 200, 1)));
        assert!(!config.subnet_contains(Ipv4Addr::new(10, 21, 0, 1)));
    }

    #[test]
    fn dictionary_round_trip() {
        let mut config = TunnelConfig::default();
        config.match_domains = vec!["corp.example".into()];
        let parsed = TunnelConfig::from_dictionary(&config.to_dictionary()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn rejects_invalid_values() {
        assert_eq!(
            TunnelConfig::from_dictionary(&dictionary(&[(MTU_KEY, "large")])),
            Err(ConfigError::InvalidValue {
                key: MTU_KEY,
                value: "large".into()
            })
        );
        assert!(matches!(
            TunnelConfig::from_dictionary(&dictionary(&[(SUBNET_KEY, "255.0.255.0")])),
            Err(ConfigError::NonContiguousMask(_))
        ));
        assert_eq!(
            TunnelConfig::from_dictionary(&dictionary(&[(DNS_KEY, " , ")])),
            Err(ConfigError::MissingDnsAddress)
        );
        assert!(TunnelConfig::from_dictionary(&dictionary(&[(FLOW_CONTROL_POLICY_KEY, "wait")])).is_err());
        assert!(TunnelConfig::from_dictionary(&dictionary(&[(RING_CAPACITY_KEY, "0")])).is_err());
    }

    #[test]
    fn mtu_is_clamped() {
        assert_eq!(normalize_mtu(10), MIN_MTU);
        assert_eq!(normalize_mtu(1500), 1500);
        assert_eq!(normalize_mtu(65_000), MAX_MTU);
    }
}
