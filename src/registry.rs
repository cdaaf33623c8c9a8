// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service registry: the static mapping from URL path to upstream
//! multicast endpoint and framing type.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};

/// How a datagram's payload is extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// RFC 3550 RTP framing; the fixed header (and CSRC/extension/padding)
    /// is stripped before forwarding.
    Rtp,
    /// Raw UDP payload, forwarded verbatim.
    UdpRaw,
}

impl Framing {
    /// Parse a config-file token (`MRTP`/`MUDP`) or CLI-friendly token
    /// (`RTP`/`UDP_RAW`), case-insensitively.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "MRTP" | "RTP" => Some(Framing::Rtp),
            "MUDP" | "UDP_RAW" | "UDP" => Some(Framing::UdpRaw),
            _ => None,
        }
    }
}

/// An immutable, resolved upstream endpoint plus the framing to apply.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub url_path: String,
    pub framing: Framing,
    pub group_addr: SocketAddr,
    pub source_addr: Option<SocketAddr>,
}

impl ServiceDescriptor {
    pub fn is_multicast(&self) -> bool {
        match self.group_addr {
            SocketAddr::V4(a) => a.ip().is_multicast(),
            SocketAddr::V6(a) => a.ip().is_multicast(),
        }
    }
}

/// A single `[services]` declaration before hostname resolution.
pub struct ServiceEntry {
    pub url_path: String,
    pub framing_token: String,
    pub group_host: String,
    pub group_port: u16,
    pub source_host: Option<String>,
    pub source_port: Option<u16>,
}

/// Read-only mapping from URL path to resolved service descriptor, built
/// once at startup. Duplicate `url_path`s: the last declaration wins.
#[derive(Debug, Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve and insert one entry. Resolution uses the OS's datagram
    /// resolver (`ToSocketAddrs` restricted to a UDP-shaped lookup); if
    /// resolution yields multiple addresses the first is used and a
    /// warning is logged. Rejects unknown framing tokens.
    pub fn insert_entry(&mut self, entry: ServiceEntry) -> Result<(), String> {
        let framing = Framing::parse(&entry.framing_token)
            .ok_or_else(|| format!("unsupported service type: {}", entry.framing_token))?;

        let group_addr = resolve_one(&entry.group_host, entry.group_port)
            .map_err(|e| format!("cannot resolve {}: {e}", entry.url_path))?;

        let source_addr = match (&entry.source_host, entry.source_port) {
            (Some(host), port) => {
                Some(resolve_one(host, port.unwrap_or(0)).map_err(|e| format!("cannot resolve SSM source for {}: {e}", entry.url_path))?)
            }
            (None, _) => None,
        };

        let descriptor = ServiceDescriptor {
            url_path: entry.url_path.clone(),
            framing,
            group_addr,
            source_addr,
        };

        if self.services.contains_key(&entry.url_path) {
            log::warn!("duplicate service url '{}': last declaration wins", entry.url_path);
        }
        self.services.insert(entry.url_path, descriptor);
        Ok(())
    }

    pub fn get(&self, url_path: &str) -> Option<&ServiceDescriptor> {
        self.services.get(url_path)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Resolve `host:port` to one socket address via the datagram resolver,
/// warning when the result is ambiguous.
pub fn resolve_one(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    let first = addrs
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"))?;
    if addrs.next().is_some() {
        log::warn!("address '{host}:{port}' is ambiguous, using {first}");
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, ty: &str, host: &str, port: u16) -> ServiceEntry {
        ServiceEntry {
            url_path: path.to_string(),
            framing_token: ty.to_string(),
            group_host: host.to_string(),
            group_port: port,
            source_host: None,
            source_port: None,
        }
    }

    #[test]
    fn rejects_unknown_framing() {
        let mut reg = ServiceRegistry::new();
        let err = reg
            .insert_entry(entry("ch5", "BOGUS", "239.1.1.1", 5000))
            .unwrap_err();
        assert!(err.contains("unsupported service type"));
    }

    #[test]
    fn duplicate_url_path_last_wins() {
        let mut reg = ServiceRegistry::new();
        reg.insert_entry(entry("ch5", "MRTP", "239.1.1.1", 5000)).unwrap();
        reg.insert_entry(entry("ch5", "MUDP", "239.1.1.2", 6000)).unwrap();
        assert_eq!(reg.len(), 1);
        let desc = reg.get("ch5").unwrap();
        assert_eq!(desc.framing, Framing::UdpRaw);
        assert_eq!(desc.group_addr.port(), 6000);
    }

    #[test]
    fn resolves_literal_ipv4() {
        let mut reg = ServiceRegistry::new();
        reg.insert_entry(entry("ch5", "MRTP", "239.1.1.1", 5000)).unwrap();
        let desc = reg.get("ch5").unwrap();
        assert!(desc.is_multicast());
        assert_eq!(desc.framing, Framing::Rtp);
    }

    #[test]
    fn framing_parse_is_case_insensitive() {
        assert_eq!(Framing::parse("mrtp"), Some(Framing::Rtp));
        assert_eq!(Framing::parse("MUDP"), Some(Framing::UdpRaw));
        assert_eq!(Framing::parse("weird"), None);
    }
}
