/// Signal handling for graceful shutdown.
///
/// First SIGTERM/SIGINT: request shutdown. The poll loops read the flag on
/// their next iteration and unwind normally, so rule removal stays with the
/// redirect guard.
/// Second signal: force. A proxy still inside its stop grace period is
/// killed immediately.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Default)]
struct Flags {
    requested: AtomicBool,
    forced: AtomicBool,
}

/// Shared shutdown flags. Set once, never cleared.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flags: Arc<Flags>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register SIGTERM/SIGINT listeners that drive these flags.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install(&self) -> std::io::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let flags = self.clone();

        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigint.recv() => "SIGINT",
                };
                if flags.is_requested() {
                    tracing::warn!(signal = name, "second signal, killing proxy");
                    flags.force();
                    break;
                }
                tracing::info!(signal = name, "caught signal, shutting down");
                flags.trigger();
            }
        });
        Ok(())
    }

    pub fn trigger(&self) {
        self.flags.requested.store(true, Ordering::SeqCst);
    }

    /// Request shutdown and skip any remaining stop grace period.
    pub fn force(&self) {
        self.flags.requested.store(true, Ordering::SeqCst);
        self.flags.forced.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flags.requested.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.flags.forced.load(Ordering::SeqCst)
    }
}
