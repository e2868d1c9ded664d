//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//! - Trigger appropriate actions (shutdown, reload)
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT forces an immediate exit
//! - SIGHUP triggers config reload, not shutdown

use std::io;

use crate::lifecycle::Shutdown;

/// What a received signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

#[cfg(unix)]
async fn next_signal() -> io::Result<SignalEvent> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|()| SignalEvent::Shutdown),
        _ = term.recv() => Ok(SignalEvent::Shutdown),
        _ = hup.recv() => Ok(SignalEvent::Reload),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> io::Result<SignalEvent> {
    tokio::signal::ctrl_c().await.map(|()| SignalEvent::Shutdown)
}

/// Dispatch signals until the process exits. `on_reload` runs for every
/// SIGHUP.
pub async fn handle_signals<F>(shutdown: &Shutdown, on_reload: F) -> io::Result<()>
where
    F: Fn(),
{
    let mut shutting_down = false;
    loop {
        match next_signal().await? {
            SignalEvent::Reload => {
                tracing::info!("SIGHUP received, reloading configuration");
                on_reload();
            }
            SignalEvent::Shutdown if shutting_down => {
                tracing::warn!("Second shutdown signal, exiting immediately");
                std::process::exit(1);
            }
            SignalEvent::Shutdown => {
                tracing::info!("Shutdown signal received");
                shutting_down = true;
                shutdown.trigger();
            }
        }
    }
}
