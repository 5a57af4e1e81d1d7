mod config;
mod roles;

use anyhow::Context;
use clap::Parser;
use config::{Config, Flags};
use fabric::{Registry, Shutdown};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    cli_common::init_logging(&flags.log);

    // Validation runs before any region, segment, or endpoint is created,
    // so a bad flag set aborts with nothing to clean up.
    let cfg = Config::from_flags(&flags).context("invalid configuration")?;
    let registry = Registry::from_env().context("selecting rendezvous directory")?;

    let shutdown = Shutdown::new();
    install_sigint(shutdown.clone())?;

    tracing::info!(role = ?cfg.role, server = cfg.server_id, "starting");
    roles::run(cfg, registry, shutdown)
}

static SIGINT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    SIGINT.store(true, Ordering::Release);
}

/// Translate SIGINT into a raised shutdown. The handler itself only flips
/// an async-signal-safe flag; a watcher thread off the data path does the
/// rest.
fn install_sigint(shutdown: Shutdown) -> anyhow::Result<()> {
    // Safety: on_sigint is async-signal-safe (a single atomic store).
    unsafe {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
    std::thread::Builder::new()
        .name("sigint-watch".to_string())
        .spawn(move || {
            while !SIGINT.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(50));
            }
            tracing::info!("caught SIGINT; stopping");
            shutdown.raise();
        })
        .context("spawning signal watcher")?;
    Ok(())
}
