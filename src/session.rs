// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session worker: handles one accepted connection end to end.

use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::admission::ConcurrencyGate;
use crate::error::SessionExit;
use crate::http::{
    self, bad_request_body, not_implemented_body, service_not_found_body, service_unavailable_body,
    write_ok_headers, write_status_response, HttpVersion, RequestError,
};
use crate::registry::ServiceRegistry;
use crate::relay;
use crate::resolver::ResolveError;

/// Everything a worker needs that doesn't change across the lifetime of
/// the dispatcher; shared via `Arc` so cloning is cheap.
pub struct SessionContext {
    pub registry: Arc<ServiceRegistry>,
    pub gate: ConcurrencyGate,
    pub udpxy_enabled: bool,
}

/// Run one session to completion. Never panics across this boundary —
/// the dispatcher wraps the call in `catch_unwind`; this function itself
/// only returns an exit code.
pub fn run(mut stream: TcpStream, ctx: &SessionContext) -> SessionExit {
    let peer = stream.peer_addr().ok();

    let permit = match ctx.gate.admit() {
        Some(p) => p,
        None => {
            log::info!("admission refused for {peer:?}: at capacity ({}/{})", ctx.gate.current(), ctx.gate.max());
            let _ = write_status_response(
                &mut stream,
                "503 Service Unavailable",
                "text/html",
                service_unavailable_body().as_bytes(),
            );
            return SessionExit::Clean;
        }
    };

    let exit = run_admitted(&mut stream, ctx);
    drop(permit);
    exit
}

fn run_admitted(stream: &mut TcpStream, ctx: &SessionContext) -> SessionExit {
    let mut reader = match http::into_buf_reader(stream.try_clone().expect("clone accepted socket")) {
        Ok(r) => r,
        Err(_) => return SessionExit::ReadFailed,
    };

    let request = match http::read_request(&mut reader) {
        Ok(r) => r,
        Err(RequestError::ReadFailed) => return SessionExit::ReadFailed,
        Err(RequestError::BadRequest) => {
            reply(stream, HttpVersion::Http1x, "400 Bad Request", &bad_request_body());
            return SessionExit::BadRequest;
        }
        Err(RequestError::Io(_)) => return SessionExit::ReadFailed,
    };

    if request.method != "GET" {
        reply(stream, request.version, "501 Not Implemented", &not_implemented_body());
        return SessionExit::UnknownMethod;
    }

    let descriptor = match crate::resolver::resolve(&request.url, &ctx.registry, ctx.udpxy_enabled) {
        Ok(d) => d,
        Err(ResolveError::Malformed) => {
            reply(stream, request.version, "400 Bad Request", &bad_request_body());
            return SessionExit::BadRequest;
        }
        Err(ResolveError::NotFound) => {
            reply(stream, request.version, "404 Service not found!", &service_not_found_body());
            return SessionExit::Clean;
        }
    };

    let (upstream_socket, needs_filter) = match relay::join_group(&descriptor) {
        Ok(pair) => pair,
        Err(exit) => {
            reply(stream, request.version, "503 Service Unavailable", &service_unavailable_body());
            return exit;
        }
    };

    if request.version == HttpVersion::Http1x {
        if write_ok_headers(stream).is_err() {
            return SessionExit::WriteFailed;
        }
    }

    log::info!("streaming {} to {:?}", descriptor.url_path, stream.peer_addr());
    relay::run(upstream_socket, needs_filter, &descriptor, stream)
}

fn reply(stream: &mut TcpStream, version: HttpVersion, status_line: &str, body: &str) {
    let result = match version {
        HttpVersion::Http1x => write_status_response(stream, status_line, "text/html", body.as_bytes()),
        HttpVersion::Http09 => http::write_all_to_client(stream, body.as_bytes()),
    };
    if let Err(e) = result {
        log::debug!("failed to write error response: {e}");
    }
}

/// Run a session inside a panic boundary, converting an unwind into
/// [`SessionExit::Panicked`] rather than letting it escape into the
/// dispatcher's accept loop.
pub fn run_isolated(stream: TcpStream, ctx: &SessionContext) -> SessionExit {
    match panic::catch_unwind(AssertUnwindSafe(|| run(stream, ctx))) {
        Ok(exit) => exit,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown panic");
            log::error!("session worker panicked: {msg}");
            SessionExit::Panicked
        }
    }
}
