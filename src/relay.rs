// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast→unicast relay loop: joins the upstream group, reads
//! datagrams, applies framing, and writes payloads to the client.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};

use crate::error::SessionExit;
use crate::http::write_all_to_client;
use crate::registry::{Framing, ServiceDescriptor};
use crate::rtp::{self, SeqEvent, SeqTracker};

const UPSTREAM_TOKEN: Token = Token(0);
const CLIENT_TOKEN: Token = Token(1);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 65_536;

/// Open, bind, and join the multicast group described by `desc`.
///
/// Mirrors the historic acquisition sequence: create a datagram socket
/// for the group's address family, set address reuse, bind to the group
/// address/port, then join. When a source is configured and the
/// platform join cannot express SSM directly, the join falls back to an
/// any-source join and the relay loop filters by source address itself.
pub fn join_group(desc: &ServiceDescriptor) -> Result<(UdpSocket, bool), SessionExit> {
    if !is_multicast(&desc.group_addr.ip()) {
        log::warn!("service '{}' group address {} is not multicast", desc.url_path, desc.group_addr);
        return Err(SessionExit::RtpFailed);
    }

    let domain = match desc.group_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::DGRAM, None).map_err(|_| SessionExit::RtpFailed)?;
    socket.set_reuse_address(true).map_err(|_| SessionExit::RtpFailed)?;
    socket
        .bind(&desc.group_addr.into())
        .map_err(|_| SessionExit::RtpFailed)?;

    let std_socket: UdpSocket = socket.into();

    let needs_source_filter = match (desc.group_addr, desc.source_addr) {
        (SocketAddr::V4(group), Some(SocketAddr::V4(source))) => {
            join_ssm_v4(&std_socket, *group.ip(), *source.ip())?;
            false
        }
        (SocketAddr::V4(group), None) => {
            std_socket
                .join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
                .map_err(|_| SessionExit::RtpFailed)?;
            false
        }
        (SocketAddr::V6(group), None) => {
            std_socket
                .join_multicast_v6(group.ip(), group.scope_id())
                .map_err(|_| SessionExit::RtpFailed)?;
            false
        }
        (SocketAddr::V6(group), Some(_)) => {
            // No portable SSM join for v6 via libc constants used here;
            // join any-source and filter received datagrams instead.
            std_socket
                .join_multicast_v6(group.ip(), group.scope_id())
                .map_err(|_| SessionExit::RtpFailed)?;
            true
        }
        (SocketAddr::V4(_), Some(SocketAddr::V6(_))) | (SocketAddr::V6(_), Some(SocketAddr::V4(_))) => {
            return Err(SessionExit::RtpFailed);
        }
    };

    Ok((std_socket, needs_source_filter))
}

/// Join an IPv4 source-specific multicast group via `IP_ADD_SOURCE_MEMBERSHIP`.
/// `socket2` does not expose this directly, so the raw option is set with
/// `libc::setsockopt`, following the same unsafe-FFI pattern used elsewhere
/// in this codebase for options the safe wrappers don't cover.
fn join_ssm_v4(socket: &UdpSocket, group: Ipv4Addr, source: Ipv4Addr) -> Result<(), SessionExit> {
    #[repr(C)]
    struct IpMreqSource {
        imr_multiaddr: libc::in_addr,
        imr_sourceaddr: libc::in_addr,
        imr_interface: libc::in_addr,
    }

    let mreq = IpMreqSource {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(group.octets()),
        },
        imr_sourceaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(source.octets()),
        },
        imr_interface: libc::in_addr { s_addr: 0 },
    };

    // SAFETY: `mreq` is a validly initialized, correctly sized
    // `ip_mreq_source` for the lifetime of this call; the fd is owned by
    // `socket` and outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_ADD_SOURCE_MEMBERSHIP,
            &mreq as *const IpMreqSource as *const libc::c_void,
            std::mem::size_of::<IpMreqSource>() as libc::socklen_t,
        )
    };

    if rc != 0 {
        return Err(SessionExit::RtpFailed);
    }
    Ok(())
}

/// Run the relay loop until the client disconnects, the upstream stalls,
/// or a write fails. Returns the terminal [`SessionExit`].
pub fn run(
    upstream: UdpSocket,
    needs_source_filter: bool,
    desc: &ServiceDescriptor,
    client: &mut TcpStream,
) -> SessionExit {
    upstream
        .set_nonblocking(true)
        .expect("nonblocking toggle on a freshly created socket cannot fail");

    let mut mio_upstream = MioUdpSocket::from_std(upstream);
    let cloned_client = match client.try_clone() {
        Ok(c) => c,
        Err(_) => return SessionExit::WriteFailed,
    };
    if cloned_client.set_nonblocking(true).is_err() {
        return SessionExit::WriteFailed;
    }
    let mut mio_client = mio::net::TcpStream::from_std(cloned_client);

    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(_) => return SessionExit::SockReadFailed,
    };
    let mut events = Events::with_capacity(16);

    if poll
        .registry()
        .register(&mut mio_upstream, UPSTREAM_TOKEN, Interest::READABLE)
        .is_err()
    {
        return SessionExit::SockReadFailed;
    }
    if poll
        .registry()
        .register(&mut mio_client, CLIENT_TOKEN, Interest::READABLE)
        .is_err()
    {
        return SessionExit::WriteFailed;
    }

    let mut seq_tracker = SeqTracker::new();
    let mut datagram_buf = vec![0u8; MAX_DATAGRAM];

    // `deadline` marks five seconds of silence from the upstream group;
    // a spurious wakeup (`poll` returning with no events before the
    // timeout truly elapses, which `mio::Poll::poll` is permitted to do)
    // must not be mistaken for that timeout, so elapsed time is tracked
    // explicitly and the remaining duration re-polled instead.
    let mut deadline = Instant::now() + INACTIVITY_TIMEOUT;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return SessionExit::SockReadFailed;
        }
        let remaining = deadline - now;

        match poll.poll(&mut events, Some(remaining)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return SessionExit::SockReadFailed,
        }

        if events.is_empty() {
            // Spurious wakeup or a genuine timeout; either way, looping
            // back re-checks elapsed time against `deadline` above.
            continue;
        }

        let mut client_ready = false;
        let mut upstream_ready = false;
        for event in events.iter() {
            match event.token() {
                CLIENT_TOKEN => client_ready = true,
                UPSTREAM_TOKEN => upstream_ready = true,
                _ => {}
            }
        }

        if client_ready {
            return SessionExit::WriteFailed;
        }

        if !upstream_ready {
            continue;
        }

        let (len, src) = match mio_upstream.recv_from(&mut datagram_buf) {
            Ok(pair) => pair,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(_) => return SessionExit::SockReadFailed,
        };

        deadline = Instant::now() + INACTIVITY_TIMEOUT;

        if needs_source_filter {
            if let Some(expected) = desc.source_addr {
                if src.ip() != expected.ip() {
                    log::debug!("dropping datagram from unexpected source {src}");
                    continue;
                }
            }
        }

        let datagram = &datagram_buf[..len];

        let payload: &[u8] = match desc.framing {
            Framing::UdpRaw => datagram,
            Framing::Rtp => match rtp::parse_payload(datagram) {
                Some(view) => {
                    match seq_tracker.observe(view.sequence) {
                        SeqEvent::Duplicate => {
                            log::debug!("dropping duplicate RTP sequence {}", view.sequence);
                            continue;
                        }
                        SeqEvent::Gap => {
                            log::debug!("RTP sequence gap/reorder at {}", view.sequence);
                        }
                        SeqEvent::InOrder => {}
                    }
                    &datagram[view.start..view.start + view.len]
                }
                None => {
                    log::debug!("dropping malformed RTP datagram ({len} bytes)");
                    continue;
                }
            },
        };

        // A broken pipe (client gone) and any other write error both end
        // the session the same way; Rust already ignores SIGPIPE, so this
        // never needs special handling beyond the exit code.
        if write_all_to_client(client, payload).is_err() {
            return SessionExit::WriteFailed;
        }
    }
}

/// Best-effort check that an address is in the multicast range for its
/// family, used before attempting acquisition so a misconfigured service
/// fails fast with a clear log line rather than an opaque join error.
pub fn is_multicast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn multicast_range_v4() {
        assert!(is_multicast(&IpAddr::V4(Ipv4Addr::new(239, 1, 1, 1))));
        assert!(!is_multicast(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn multicast_range_v6() {
        assert!(is_multicast(&IpAddr::V6(Ipv6Addr::new(
            0xff02, 0, 0, 0, 0, 0, 0, 1
        ))));
        assert!(!is_multicast(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }
}
