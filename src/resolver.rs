// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! URL resolver: maps an inbound request path to an upstream service,
//! either via the static registry or the dynamic UDPxy grammar.

use crate::registry::{resolve_one, Framing, ServiceDescriptor, ServiceRegistry};

/// Why [`resolve`] failed to produce a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    /// The URL has no `/` at all — malformed, distinct from a
    /// well-formed path that simply names no known service.
    Malformed,
    /// The path (or UDPxy grammar) is well-formed but names nothing the
    /// gateway can serve.
    NotFound,
}

/// Resolve `url` against `registry`, falling back to the UDPxy grammar
/// when `udpxy_enabled` is set. Returns an owned descriptor — there is
/// no shared static scratch buffer, so concurrent resolutions on
/// different worker threads never alias.
pub fn resolve(
    url: &str,
    registry: &ServiceRegistry,
    udpxy_enabled: bool,
) -> Result<ServiceDescriptor, ResolveError> {
    let last_segment = last_path_segment(url).ok_or(ResolveError::Malformed)?;

    if let Some(desc) = registry.get(last_segment) {
        return Ok(desc.clone());
    }

    if udpxy_enabled {
        if let Some(desc) = udpxy_parse(url) {
            return Ok(desc);
        }
    }

    Err(ResolveError::NotFound)
}

/// Text after the last `/` in the path, or `None` if there is no `/` at
/// all (a malformed URL per the HTTP reader).
fn last_path_segment(url: &str) -> Option<&str> {
    let idx = url.rfind('/')?;
    Some(&url[idx + 1..])
}

/// Parse the UDPxy convention: `/rtp/host:port` or `/udp/host:port`,
/// with optional `[ipv6]:port` bracketing and percent-encoding in the
/// trailing host:port segment.
fn udpxy_parse(url: &str) -> Option<ServiceDescriptor> {
    let framing = if url.starts_with("/rtp/") {
        Framing::Rtp
    } else if url.starts_with("/udp/") {
        Framing::UdpRaw
    } else {
        return None;
    };

    let raw_segment = last_path_segment(url)?;
    let decoded = percent_decode(raw_segment);

    let (host, port) = split_host_port(&decoded)?;

    let addr = resolve_one(&host, port).ok()?;

    Some(ServiceDescriptor {
        url_path: decoded,
        framing,
        group_addr: addr,
        source_addr: None,
    })
}

/// Split a decoded `host:port` or `[v6]:port` segment. Default port is
/// `1234` when absent, matching the historic UDPxy behaviour.
fn split_host_port(segment: &str) -> Option<(String, u16)> {
    if let Some(stripped) = segment.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        let rest = &stripped[end + 1..];
        let port = match rest.strip_prefix(':') {
            Some(p) if !p.is_empty() => p.parse().ok()?,
            _ => 1234,
        };
        Some((host.to_string(), port))
    } else {
        match segment.rfind(':') {
            Some(idx) => {
                let host = &segment[..idx];
                let port_str = &segment[idx + 1..];
                let port = if port_str.is_empty() {
                    1234
                } else {
                    port_str.parse().ok()?
                };
                Some((host.to_string(), port))
            }
            None => Some((segment.to_string(), 1234)),
        }
    }
}

/// Decode `%HH` escapes in place. Bytes that don't form a valid escape
/// pass through unchanged.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_segment_of_plain_path() {
        assert_eq!(last_path_segment("/ch5"), Some("ch5"));
        assert_eq!(last_path_segment("/a/b/ch5"), Some("ch5"));
        assert_eq!(last_path_segment("noSlash"), None);
    }

    #[test]
    fn percent_decode_roundtrips() {
        assert_eq!(percent_decode("%5B%3A%3A1%5D:1234"), "[::1]:1234");
        assert_eq!(percent_decode("239.0.0.1:5000"), "239.0.0.1:5000");
        assert_eq!(percent_decode("100%"), "100%");
    }

    #[test]
    fn split_ipv4_host_port() {
        assert_eq!(
            split_host_port("239.0.0.1:5000"),
            Some(("239.0.0.1".to_string(), 5000))
        );
    }

    #[test]
    fn split_ipv4_defaults_port() {
        assert_eq!(
            split_host_port("239.0.0.1"),
            Some(("239.0.0.1".to_string(), 1234))
        );
    }

    #[test]
    fn split_bracketed_ipv6_host_port() {
        assert_eq!(
            split_host_port("[::1]:1234"),
            Some(("::1".to_string(), 1234))
        );
    }

    #[test]
    fn split_bracketed_ipv6_defaults_port() {
        assert_eq!(split_host_port("[::1]"), Some(("::1".to_string(), 1234)));
    }

    #[test]
    fn udpxy_requires_known_prefix() {
        assert!(udpxy_parse("/other/239.0.0.1:5000").is_none());
    }

    #[test]
    fn udpxy_parses_rtp_prefix() {
        let desc = udpxy_parse("/rtp/239.0.0.1:5000").unwrap();
        assert_eq!(desc.framing, Framing::Rtp);
        assert_eq!(desc.group_addr.port(), 5000);
    }

    #[test]
    fn udpxy_percent_encoded_matches_plain() {
        let plain = udpxy_parse("/udp/[::1]:1234").unwrap();
        let encoded = udpxy_parse("/udp/%5B%3A%3A1%5D:1234").unwrap();
        assert_eq!(plain.group_addr, encoded.group_addr);
        assert_eq!(plain.framing, encoded.framing);
    }

    #[test]
    fn resolve_prefers_registry_over_udpxy() {
        let mut registry = ServiceRegistry::new();
        registry
            .insert_entry(crate::registry::ServiceEntry {
                url_path: "ch5".to_string(),
                framing_token: "MRTP".to_string(),
                group_host: "239.1.1.1".to_string(),
                group_port: 5000,
                source_host: None,
                source_port: None,
            })
            .unwrap();
        let desc = resolve("/ch5", &registry, true).unwrap();
        assert_eq!(desc.group_addr.port(), 5000);
    }

    #[test]
    fn resolve_falls_back_to_udpxy_when_enabled() {
        let registry = ServiceRegistry::new();
        let desc = resolve("/rtp/239.0.0.1:5000", &registry, true).unwrap();
        assert_eq!(desc.framing, Framing::Rtp);
    }

    #[test]
    fn resolve_returns_not_found_when_udpxy_disabled() {
        let registry = ServiceRegistry::new();
        assert!(matches!(
            resolve("/rtp/239.0.0.1:5000", &registry, false),
            Err(ResolveError::NotFound)
        ));
    }

    #[test]
    fn resolve_rejects_url_with_no_slash_as_malformed() {
        let registry = ServiceRegistry::new();
        assert!(matches!(resolve("noslash", &registry, true), Err(ResolveError::Malformed)));
    }
}
