// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listener/dispatcher: binds endpoints, accepts connections, spawns
//! session workers, and reaps them via a channel.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::admission::ConcurrencyGate;
use crate::config::{BindEndpoint, GatewayConfig};
use crate::error::{GatewayError, SessionExit};
use crate::registry::ServiceRegistry;
use crate::session::{self, SessionContext};

pub type WorkerId = u64;

/// A live accepted connection, owned exclusively by the dispatcher until
/// the reaper removes it.
struct ClientRecord {
    peer: SocketAddr,
    _handle: thread::JoinHandle<()>,
}

type Roster = HashMap<WorkerId, ClientRecord>;

/// One bound, listening socket plus the address it actually resolved to
/// (useful for logging which of several `[bind]` lines came up).
struct BoundListener {
    listener: TcpListener,
    addr: SocketAddr,
}

/// Distinguishes which acquisition step failed for one endpoint, so the
/// caller can tell a `bind()` failure from a `listen()` failure (spec §7
/// lists them as separate kinds, both fatal only if every endpoint hits
/// the same one).
enum BindStep {
    Bind(std::io::Error),
    Listen(std::io::Error),
}

/// Bind every configured endpoint, skipping (and warning about) any that
/// fails while others succeed. Fails the whole startup only if *no*
/// endpoint could be bound: with `ListenFailure` if every failure
/// happened at the `listen()` step, `BindFailure` otherwise.
fn bind_all(endpoints: &[BindEndpoint]) -> Result<Vec<BoundListener>, GatewayError> {
    let mut bound = Vec::new();
    let mut bind_failures = 0usize;
    let mut listen_failures = 0usize;

    for endpoint in endpoints {
        let host = endpoint.host.as_deref().unwrap_or("0.0.0.0");
        let resolved = match (host, endpoint.port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                log::warn!("cannot resolve bind endpoint {host}:{}: {e}", endpoint.port);
                None
            }
        };
        let Some(addr) = resolved else { continue };

        match bind_one(addr) {
            Ok(listener) => {
                log::info!("listening on {addr}");
                bound.push(BoundListener { listener, addr });
            }
            Err(BindStep::Bind(e)) => {
                log::warn!("failed to bind {addr}: {e}");
                bind_failures += 1;
            }
            Err(BindStep::Listen(e)) => {
                log::warn!("failed to listen on {addr}: {e}");
                listen_failures += 1;
            }
        }
    }

    if bound.is_empty() {
        if listen_failures > 0 && bind_failures == 0 {
            return Err(GatewayError::ListenFailure);
        }
        return Err(GatewayError::BindFailure);
    }

    Ok(bound)
}

fn bind_one(addr: SocketAddr) -> Result<TcpListener, BindStep> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(16).map_err(BindStep::Listen)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl From<std::io::Error> for BindStep {
    fn from(e: std::io::Error) -> Self {
        BindStep::Bind(e)
    }
}

/// Every listening socket the dispatcher will serve, opaque to callers
/// beyond "how many came up". Binding happens up front, before an
/// optional daemonise step, so a detach never has to report a bind
/// failure back through a severed terminal.
pub struct BoundGateway {
    listeners: Vec<BoundListener>,
}

impl BoundGateway {
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

/// Resolve and bind every configured endpoint. Call this before
/// [`daemon::daemonise`](crate::daemon::daemonise) so all listening
/// sockets are open while the process still has a controlling terminal
/// to report failures to.
pub fn bind(config: &GatewayConfig) -> Result<BoundGateway, GatewayError> {
    Ok(BoundGateway {
        listeners: bind_all(&config.bind_endpoints)?,
    })
}

/// Run the dispatcher until `shutdown` is set, using sockets already
/// opened by [`bind`]. Blocks the calling thread in the accept loop; the
/// reaper runs on its own thread.
pub fn serve(
    bound: BoundGateway,
    config: &GatewayConfig,
    registry: Arc<ServiceRegistry>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), GatewayError> {
    let bound = bound.listeners;

    let gate = ConcurrencyGate::new(config.max_clients);
    let roster: Arc<Mutex<Roster>> = Arc::new(Mutex::new(HashMap::new()));
    let next_id = Arc::new(AtomicU64::new(1));
    let (reap_tx, reap_rx) = mpsc::channel::<(WorkerId, SessionExit, SocketAddr)>();

    let reaper_roster = Arc::clone(&roster);
    let reaper_gate = gate.clone();
    let reaper = thread::Builder::new()
        .name("mcastgw-reaper".into())
        .spawn(move || reap_loop(reap_rx, reaper_roster, reaper_gate))
        .map_err(GatewayError::Io)?;

    let ctx = Arc::new(SessionContext {
        registry,
        gate: gate.clone(),
        udpxy_enabled: config.udpxy_enabled,
    });

    accept_loop(bound, shutdown, roster, next_id, reap_tx, ctx)?;

    reaper.join().expect("reaper thread panicked");
    Ok(())
}

/// One non-blocking accept loop per bound listener, each on its own
/// thread, all feeding the same roster/reap-channel. Mirrors the
/// `WouldBlock` + short sleep accept loop used elsewhere in this
/// codebase for a single listener, generalised to however many endpoints
/// were configured.
fn accept_loop(
    bound: Vec<BoundListener>,
    shutdown: Arc<AtomicBool>,
    roster: Arc<Mutex<Roster>>,
    next_id: Arc<AtomicU64>,
    reap_tx: mpsc::Sender<(WorkerId, SessionExit, SocketAddr)>,
    ctx: Arc<SessionContext>,
) -> Result<(), GatewayError> {
    let mut handles = Vec::with_capacity(bound.len());

    for b in bound {
        let shutdown = Arc::clone(&shutdown);
        let roster = Arc::clone(&roster);
        let next_id = Arc::clone(&next_id);
        let reap_tx = reap_tx.clone();
        let ctx = Arc::clone(&ctx);

        let handle = thread::Builder::new()
            .name(format!("mcastgw-accept-{}", b.addr))
            .spawn(move || accept_one(b, shutdown, roster, next_id, reap_tx, ctx))
            .map_err(GatewayError::Io)?;
        handles.push(handle);
    }

    for handle in handles {
        handle.join().expect("accept thread panicked");
    }

    Ok(())
}

fn accept_one(
    bound: BoundListener,
    shutdown: Arc<AtomicBool>,
    roster: Arc<Mutex<Roster>>,
    next_id: Arc<AtomicU64>,
    reap_tx: mpsc::Sender<(WorkerId, SessionExit, SocketAddr)>,
    ctx: Arc<SessionContext>,
) {
    while !shutdown.load(Ordering::Acquire) {
        match bound.listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                spawn_worker(stream, peer, &roster, &next_id, &reap_tx, &ctx);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!("accept on {} failed: {e}", bound.addr);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn spawn_worker(
    stream: TcpStream,
    peer: SocketAddr,
    roster: &Arc<Mutex<Roster>>,
    next_id: &Arc<AtomicU64>,
    reap_tx: &mpsc::Sender<(WorkerId, SessionExit, SocketAddr)>,
    ctx: &Arc<SessionContext>,
) {
    let worker_id = next_id.fetch_add(1, Ordering::Relaxed);
    let worker_ctx = Arc::clone(ctx);
    let worker_tx = reap_tx.clone();

    // Lock the roster before spawning and hold it across the insert so
    // the reaper can never observe a reap message for a worker_id that
    // isn't in the map yet — the worker can't send that message until
    // after it has actually run, which can't happen before `spawn`
    // returns.
    let mut guard = roster.lock().unwrap_or_else(|e| e.into_inner());
    let handle = thread::Builder::new()
        .name(format!("mcastgw-worker-{worker_id}"))
        .spawn(move || {
            let exit = session::run_isolated(stream, &worker_ctx);
            log::info!("session {worker_id} for {peer} exited: {exit}");
            let _ = worker_tx.send((worker_id, exit, peer));
        })
        .expect("failed to spawn session worker thread");
    guard.insert(worker_id, ClientRecord { peer, _handle: handle });
    drop(guard);
}

fn reap_loop(rx: mpsc::Receiver<(WorkerId, SessionExit, SocketAddr)>, roster: Arc<Mutex<Roster>>, gate: ConcurrencyGate) {
    while let Ok((worker_id, exit, peer)) = rx.recv() {
        let mut guard = roster.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&worker_id);
        drop(guard);
        log::debug!("reaped worker {worker_id} ({peer}), exit={exit}, active={}", gate.current());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_all_fails_when_every_endpoint_is_unresolvable() {
        let endpoints = vec![BindEndpoint {
            host: Some("this.host.does.not.resolve.invalid".to_string()),
            port: 0,
        }];
        assert!(bind_all(&endpoints).is_err());
    }

    #[test]
    fn bind_all_succeeds_on_ephemeral_port() {
        let endpoints = vec![BindEndpoint { host: None, port: 0 }];
        let bound = bind_all(&endpoints).unwrap();
        assert_eq!(bound.len(), 1);
    }
}
