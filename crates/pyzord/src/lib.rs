//! Shared daemon plumbing for the pyzord executables.

use std::path::Path;

/// Exit status when a termination signal stopped the daemon. Supervisors
/// treat it as "do not restart".
pub const EXIT_ON_SIGNAL: i32 = 128;

/// Resolves when SIGINT, SIGQUIT or SIGTERM arrives.
pub async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => (),
        _ = quit.recv() => (),
        _ = terminate.recv() => (),
    }
    Ok(())
}

/// The state directory must exist before a daemon touches it; creating it
/// belongs to packaging, not to the server.
pub fn require_home(home: &Path) -> anyhow::Result<()> {
    anyhow::ensure!(
        home.is_dir(),
        "state directory {} does not exist",
        home.display()
    );
    Ok(())
}

/// Store options shared by the daemons' cache flag, in mebibytes.
pub fn store_options(cache_mib: usize) -> store::Options {
    store::Options::default().with_cache_size(cache_mib << 20)
}
