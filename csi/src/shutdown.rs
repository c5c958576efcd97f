//! Shutdown coordination between the gRPC server, the health endpoint and
//! the signal handler.

use std::io;

use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};

/// Fires the shutdown observed by every `Shutdown` handle.
#[derive(Debug)]
pub struct Trigger(watch::Sender<bool>);

#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn channel() -> (Trigger, Shutdown) {
    let (sender, receiver) = watch::channel(false);
    (Trigger(sender), Shutdown(receiver))
}

impl Trigger {
    pub fn fire(&self) {
        // every receiver may already be gone
        let _ = self.0.send(true);
    }
}

impl Shutdown {
    /// Resolves once the trigger fires or is dropped.
    pub async fn wait(mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Wait for SIGTERM or SIGINT, returning the name of the signal received.
pub async fn signalled() -> io::Result<&'static str> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    };
    Ok(name)
}
