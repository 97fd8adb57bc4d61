use std::net::Ipv4Addr;

/// One intercepted hostname and the synthetic address handed out for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsEntry {
    pub hostname: String,
    pub address: Ipv4Addr,
    pub service_ids: Vec<String>,
}

/// Hostname table. Hostnames are stored lowercased and compared without
/// regard to case.
#[derive(Debug, Default)]
pub struct DnsEntries {
    entries: Vec<DnsEntry>,
}

impl DnsEntries {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, hostname: &str) -> Option<&DnsEntry> {
        let hostname = hostname.trim_end_matches('.');
        self.entries
            .iter()
            .find(|entry| entry.hostname.eq_ignore_ascii_case(hostname))
    }

    /// Adds `service_id` as an owner of `hostname`, creating the entry with
    /// `address` when the hostname is new. Returns the entry's address.
    pub fn add(&mut self, hostname: &str, address: Ipv4Addr, service_id: &str) -> Ipv4Addr {
        let hostname = hostname.trim_end_matches('.');
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.hostname.eq_ignore_ascii_case(hostname))
        {
            if !entry.service_ids.iter().any(|id| id == service_id) {
                entry.service_ids.push(service_id.to_string());
            }
            return entry.address;
        }
        self.entries.push(DnsEntry {
            hostname: hostname.to_ascii_lowercase(),
            address,
            service_ids: vec![service_id.to_string()],
        });
        address
    }

    /// Drops `service_id` from every entry and removes entries left without
    /// owners. Returns the removed hostnames.
    pub fn remove_service(&mut self, service_id: &str) -> Vec<String> {
        for entry in &mut self.entries {
            entry.service_ids.retain(|id| id != service_id);
        }
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            if entry.service_ids.is_empty() {
                removed.push(entry.hostname.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn is_assigned(&self, address: Ipv4Addr) -> bool {
        self.entries.iter().any(|entry| entry.address == address)
    }

    pub fn by_address(&self, address: Ipv4Addr) -> Vec<DnsEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.address == address)
            .cloned()
            .collect()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.hostname.clone()).collect()
    }
}
