// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast RTP/UDP to unicast HTTP gateway.
//!
//! ```bash
//! mcastgw --listen 8888 --maxclients 10
//! mcastgw --config /etc/mcastgw.conf
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use mcastgw::config::{Args, GatewayConfig};
use mcastgw::error::GatewayError;
use mcastgw::registry::ServiceRegistry;
use mcastgw::{daemon, dispatcher};

fn main() {
    let args = Args::parse();

    match run(args) {
        Ok(()) => {}
        Err(e) => {
            // `error!` here is the "FATAL" level of the historic
            // taxonomy: the process aborts immediately after logging it.
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<(), GatewayError> {
    let config = GatewayConfig::from_args(&args).map_err(|e| GatewayError::ConfigInvalid(e.to_string()))?;

    init_logger(&config);

    let mut registry = ServiceRegistry::new();
    for entry in config.registry_entries.clone() {
        let url_path = entry.url_path.clone();
        if let Err(e) = registry.insert_entry(entry) {
            log::warn!("skipping service '{url_path}': {e}");
        }
    }
    let registry = Arc::new(registry);

    log::info!(
        "mcastgw starting: {} service(s), {} bind endpoint(s), maxclients={}",
        registry.len(),
        config.bind_endpoints.len(),
        config.max_clients
    );

    let bound = dispatcher::bind(&config)?;
    log::info!("bound {} listening socket(s)", bound.listener_count());

    if config.daemonise {
        daemon::daemonise().map_err(GatewayError::Io)?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handler(Arc::clone(&shutdown));

    dispatcher::serve(bound, &config, registry, shutdown)
}

fn init_logger(config: &GatewayConfig) {
    let filter = config.verbosity.to_filter();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

/// Install a `SIGINT`/`SIGTERM` handler that flips the shutdown flag
/// checked by the dispatcher's accept loops. Uses `libc::signal` with a
/// minimal handler rather than pulling in a signal-handling crate, since
/// all it needs to do is set one atomic flag.
fn install_signal_handler(shutdown: Arc<AtomicBool>) {
    use std::sync::OnceLock;

    static SHUTDOWN_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    let _ = SHUTDOWN_FLAG.set(shutdown);

    extern "C" fn handle(_signum: libc::c_int) {
        if let Some(flag) = SHUTDOWN_FLAG.get() {
            flag.store(true, Ordering::Release);
        }
    }

    #[cfg(unix)]
    // SAFETY: `handle` has the signature `libc::signal` expects and never
    // panics or allocates, so it is sound to run as a signal handler.
    unsafe {
        libc::signal(libc::SIGINT, handle as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle as libc::sighandler_t);
    }
}
