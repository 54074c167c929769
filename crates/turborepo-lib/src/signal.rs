//! Ctrl-C handling: one subscriber fans the signal out to anything that
//! needs to wind down.

use tokio::sync::watch;
use tracing::debug;

/// Listens for interrupt signals and exposes them as a watch channel.
pub struct SignalHandler {
    rx: watch::Receiver<bool>,
}

impl SignalHandler {
    pub fn install() -> Self {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("received interrupt, beginning shutdown");
                tx.send(true).ok();
            }
        });
        Self { rx }
    }

    /// Resolves when an interrupt arrives. Never resolves if none does.
    pub async fn interrupted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Signal task ended without firing; stay pending forever.
                std::future::pending::<()>().await;
            }
        }
    }
}
