use std::collections::HashSet;
use std::net::Ipv4Addr;

use mergen_types::{PortBinding, PortBindingRequest, VmMetadata};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid guest cidr: {0}")]
    InvalidCidr(String),
    #[error("no available guest IP address in CIDR")]
    NoIpAvailable,
    #[error("guest port is invalid: {0}")]
    InvalidGuestPort(i64),
    #[error("host port is invalid: {0}")]
    InvalidHostPort(i64),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("no available host port in configured range")]
    NoHostPortAvailable,
    #[error("host port already allocated: {0}")]
    HostPortTaken(u16),
    #[error("duplicate host port requested in payload: {0}")]
    DuplicateHostPort(u16),
}

/// Stateless resource allocator. Uniqueness is derived at call time from the
/// persisted VM set; reservations are local to a single allocate call.
pub struct Allocator {
    port_start: u16,
    port_end: u16,
    guest_cidr: String,
}

impl Allocator {
    pub fn new(port_start: u16, port_end: u16, guest_cidr: impl Into<String>) -> Allocator {
        Allocator {
            port_start,
            port_end,
            guest_cidr: guest_cidr.into(),
        }
    }

    pub fn allocate(
        &self,
        existing: &[VmMetadata],
        requests: &[PortBindingRequest],
    ) -> Result<(String, Vec<PortBinding>), AllocError> {
        debug!(
            existing_vms = existing.len(),
            requested_ports = requests.len(),
            guest_cidr = %self.guest_cidr,
            "allocation started"
        );
        let guest_ip = self.allocate_guest_ip(existing)?;
        let ports = self.allocate_ports(existing, requests)?;
        debug!(guest_ip = %guest_ip, allocated_ports = ports.len(), "allocation completed");
        Ok((guest_ip, ports))
    }

    fn allocate_guest_ip(&self, existing: &[VmMetadata]) -> Result<String, AllocError> {
        let (network, prefix_len) = parse_cidr(&self.guest_cidr)?;
        let host_bits = 32 - prefix_len;
        if host_bits <= 1 {
            return Err(AllocError::InvalidCidr(
                "guest cidr has no usable host range".into(),
            ));
        }

        let used: HashSet<&str> = existing
            .iter()
            .filter(|vm| !vm.guest_ip.is_empty())
            .map(|vm| vm.guest_ip.as_str())
            .collect();

        let network_u32 = u32::from(network);
        let max_host = (1u64 << host_bits) - 1;
        for host in 2..max_host {
            let candidate = Ipv4Addr::from(network_u32 + host as u32).to_string();
            if used.contains(candidate.as_str()) {
                continue;
            }
            return Ok(candidate);
        }

        Err(AllocError::NoIpAvailable)
    }

    fn allocate_ports(
        &self,
        existing: &[VmMetadata],
        requests: &[PortBindingRequest],
    ) -> Result<Vec<PortBinding>, AllocError> {
        let used: HashSet<u16> = existing
            .iter()
            .flat_map(|vm| vm.ports.iter().map(|p| p.host))
            .collect();

        let mut reserved: HashSet<u16> = HashSet::new();
        let mut bindings = Vec::with_capacity(requests.len());

        for req in requests {
            if req.guest <= 0 || req.guest > 65535 {
                return Err(AllocError::InvalidGuestPort(req.guest));
            }
            if req.host < 0 || req.host > 65535 {
                return Err(AllocError::InvalidHostPort(req.host));
            }

            let protocol = req
                .protocol
                .as_deref()
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "tcp".to_string());
            if protocol != "tcp" && protocol != "udp" {
                return Err(AllocError::UnsupportedProtocol(protocol));
            }

            let host_port = if req.host == 0 {
                self.next_free_port(&used, &reserved)
                    .ok_or(AllocError::NoHostPortAvailable)?
            } else {
                req.host as u16
            };

            if used.contains(&host_port) {
                return Err(AllocError::HostPortTaken(host_port));
            }
            if reserved.contains(&host_port) {
                return Err(AllocError::DuplicateHostPort(host_port));
            }

            reserved.insert(host_port);
            debug!(
                guest_port = req.guest,
                host_port,
                protocol = %protocol,
                "allocated host port"
            );
            bindings.push(PortBinding {
                guest: req.guest as u16,
                host: host_port,
                protocol,
            });
        }

        bindings.sort_by_key(|binding| binding.host);
        Ok(bindings)
    }

    fn next_free_port(&self, used: &HashSet<u16>, reserved: &HashSet<u16>) -> Option<u16> {
        (self.port_start..=self.port_end).find(|port| !used.contains(port) && !reserved.contains(port))
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), AllocError> {
    let (addr_part, len_part) = cidr
        .split_once('/')
        .ok_or_else(|| AllocError::InvalidCidr(cidr.to_string()))?;
    let addr: Ipv4Addr = addr_part
        .trim()
        .parse()
        .map_err(|_| AllocError::InvalidCidr(cidr.to_string()))?;
    let prefix_len: u8 = len_part
        .trim()
        .parse()
        .map_err(|_| AllocError::InvalidCidr(cidr.to_string()))?;
    if prefix_len > 32 {
        return Err(AllocError::InvalidCidr(cidr.to_string()));
    }
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ok((Ipv4Addr::from(u32::from(addr) & mask), prefix_len))
}

pub fn tap_name(id: &str) -> String {
    format!("tap-{}", short_id(id))
}

pub fn netns_name(id: &str) -> String {
    format!("mergen-{}", short_id(id))
}

/// Locally-administered MAC derived from the first hex digits of the ID.
pub fn guest_mac(id: &str) -> String {
    let hex: String = id.chars().filter(|c| *c != '-').collect();
    if hex.len() < 6 {
        return "02:FC:00:00:00:01".to_string();
    }
    format!(
        "02:FC:{}:{}:{}:01",
        hex[0..2].to_uppercase(),
        hex[2..4].to_uppercase(),
        hex[4..6].to_uppercase()
    )
}

fn short_id(id: &str) -> &str {
    if id.len() > 8 {
        &id[..8]
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing_vm(guest_ip: &str, host_ports: &[u16]) -> VmMetadata {
        VmMetadata {
            guest_ip: guest_ip.to_string(),
            ports: host_ports
                .iter()
                .map(|host| PortBinding {
                    guest: 8080,
                    host: *host,
                    protocol: "tcp".into(),
                })
                .collect(),
            ..VmMetadata::default()
        }
    }

    #[test]
    fn allocates_next_ip_and_lowest_free_port() {
        let allocator = Allocator::new(20000, 20010, "172.30.0.0/24");
        let existing = vec![existing_vm("172.30.0.2", &[20000])];
        let requests = vec![
            PortBindingRequest {
                guest: 80,
                host: 0,
                protocol: None,
            },
            PortBindingRequest {
                guest: 443,
                host: 20005,
                protocol: None,
            },
        ];

        let (ip, ports) = allocator.allocate(&existing, &requests).unwrap();
        assert_eq!(ip, "172.30.0.3");
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].host, 20001);
        assert_eq!(ports[0].protocol, "tcp");
        assert_eq!(ports[1].host, 20005);
    }

    #[test]
    fn first_vm_gets_network_plus_two() {
        let allocator = Allocator::new(20000, 20010, "172.30.0.0/24");
        let (ip, _) = allocator.allocate(&[], &[]).unwrap();
        assert_eq!(ip, "172.30.0.2");
    }

    #[test]
    fn saturated_cidr_reports_no_ip() {
        // A /30 has exactly one usable address under the network+2 rule.
        let allocator = Allocator::new(20000, 20010, "10.9.8.0/30");
        let existing = vec![existing_vm("10.9.8.2", &[])];
        match allocator.allocate(&existing, &[]) {
            Err(AllocError::NoIpAvailable) => {}
            other => panic!("expected NoIpAvailable, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_port_range_is_rejected() {
        let allocator = Allocator::new(20000, 20001, "172.30.0.0/24");
        let requests: Vec<PortBindingRequest> = (0..3)
            .map(|i| PortBindingRequest {
                guest: 8000 + i,
                host: 0,
                protocol: None,
            })
            .collect();
        match allocator.allocate(&[], &requests) {
            Err(AllocError::NoHostPortAvailable) => {}
            other => panic!("expected NoHostPortAvailable, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_host_ports_in_one_request_are_rejected() {
        let allocator = Allocator::new(20000, 20010, "172.30.0.0/24");
        let requests = vec![
            PortBindingRequest {
                guest: 80,
                host: 20003,
                protocol: None,
            },
            PortBindingRequest {
                guest: 81,
                host: 20003,
                protocol: None,
            },
        ];
        match allocator.allocate(&[], &requests) {
            Err(AllocError::DuplicateHostPort(20003)) => {}
            other => panic!("expected DuplicateHostPort, got {other:?}"),
        }
    }

    #[test]
    fn taken_host_port_is_rejected() {
        let allocator = Allocator::new(20000, 20010, "172.30.0.0/24");
        let existing = vec![existing_vm("172.30.0.2", &[20004])];
        let requests = vec![PortBindingRequest {
            guest: 80,
            host: 20004,
            protocol: None,
        }];
        match allocator.allocate(&existing, &requests) {
            Err(AllocError::HostPortTaken(20004)) => {}
            other => panic!("expected HostPortTaken, got {other:?}"),
        }
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let allocator = Allocator::new(20000, 20010, "172.30.0.0/24");
        let requests = vec![PortBindingRequest {
            guest: 53,
            host: 0,
            protocol: Some("sctp".into()),
        }];
        match allocator.allocate(&[], &requests) {
            Err(AllocError::UnsupportedProtocol(p)) => assert_eq!(p, "sctp"),
            other => panic!("expected UnsupportedProtocol, got {other:?}"),
        }
    }

    #[test]
    fn derived_names_use_first_eight_chars() {
        let id = "084604f6-0766-4b7d-9d23-0b7a011d6eaa";
        assert_eq!(tap_name(id), "tap-084604f6");
        assert_eq!(netns_name(id), "mergen-084604f6");
        assert_eq!(guest_mac(id), "02:FC:08:46:04:01");
        assert_eq!(guest_mac("ab"), "02:FC:00:00:00:01");
    }
}
