//! Graceful shutdown coordinator.
//!
//! Listens for SIGINT (Ctrl+C), SIGTERM, and SIGHUP, then cancels a
//! [`tokio_util::sync::CancellationToken`] so the pipeline finishes the item
//! in hand and starts no new one. A second signal force-exits.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;

/// What a received signal should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    Drain,
    ForceExit,
}

/// Count a signal and decide its effect.
fn on_signal(count: &AtomicU32) -> SignalAction {
    if count.fetch_add(1, Ordering::SeqCst) == 0 {
        SignalAction::Drain
    } else {
        SignalAction::ForceExit
    }
}

/// Signal listeners, registered once and reused across signals.
struct Signals {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hup: tokio::signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> io::Result<()> {
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = self.term.recv() => Ok(()),
            _ = self.hup.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> io::Result<()> {
        tokio::signal::ctrl_c().await
    }
}

/// Install signal handlers and return a [`CancellationToken`] that is
/// cancelled on the first SIGINT / SIGTERM / SIGHUP.
pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    tokio::spawn(async move {
        let mut signals = match Signals::new() {
            Ok(signals) => signals,
            Err(e) => {
                tracing::warn!("Cannot listen for shutdown signals: {}", e);
                return;
            }
        };
        let count = AtomicU32::new(0);

        while signals.recv().await.is_ok() {
            match on_signal(&count) {
                SignalAction::Drain => {
                    tracing::info!("Received shutdown signal, finishing current item...");
                    tracing::info!("Press Ctrl+C again to force exit");
                    handler_token.cancel();
                }
                SignalAction::ForceExit => {
                    tracing::warn!("Force exit requested");
                    std::process::exit(130);
                }
            }
        }
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signal_drains_then_force_exits() {
        let count = AtomicU32::new(0);
        assert_eq!(on_signal(&count), SignalAction::Drain);
        assert_eq!(on_signal(&count), SignalAction::ForceExit);
        assert_eq!(on_signal(&count), SignalAction::ForceExit);
    }

    /// Signal delivery can't be safely tested in a shared test binary.
    #[tokio::test]
    async fn test_install_returns_live_token() {
        let token = install_signal_handler();
        assert!(!token.is_cancelled());
    }
}
