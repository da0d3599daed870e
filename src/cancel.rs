//! Cancellation for shutdown and for individual requests
//!
//! The process-wide signal is tripped on SIGTERM/SIGINT. Each request takes a
//! child of it whose `CancelGuard` lives in the handler future, so a caller
//! that disconnects cancels that request's cluster liveness probe. Mutating
//! work does not watch these signals.

use futures::future::select_all;
use tokio::sync::watch;
use tracing::{debug, info};

/// Receiving half; cheap to clone into every request
///
/// Fires when any of its sources fires: the root canceller or any guard
/// between the root and this signal.
#[derive(Clone)]
pub struct CancelSignal {
    receivers: Vec<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_canceller, signal) = cancel_pair();
        signal
    }

    /// A signal that fires with this one or when the returned guard drops
    pub fn child(&self) -> (CancelGuard, CancelSignal) {
        let (canceller, own) = cancel_pair();
        let mut receivers = self.receivers.clone();
        receivers.extend(own.receivers);
        (CancelGuard { canceller }, CancelSignal { receivers })
    }

    /// Resolve once cancellation is requested
    ///
    /// A source whose sender is dropped without cancelling never fires.
    pub async fn cancelled(&mut self) {
        let waits = self
            .receivers
            .iter_mut()
            .map(|receiver| Box::pin(wait_until_set(receiver)));
        select_all(waits).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.receivers.iter().any(|receiver| *receiver.borrow())
    }
}

async fn wait_until_set(receiver: &mut watch::Receiver<bool>) {
    let closed = receiver.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Cancels its child signal when dropped
pub struct CancelGuard {
    canceller: Canceller,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.canceller.sender.send(true).is_ok() {
            debug!("Request dropped, cancelling its probe");
        }
    }
}

/// Sending half, owned by whoever decides to cancel
pub struct Canceller {
    sender: watch::Sender<bool>,
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
        info!("Cancellation requested");
    }
}

pub fn cancel_pair() -> (Canceller, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        Canceller { sender },
        CancelSignal {
            receivers: vec![receiver],
        },
    )
}

/// Wait for SIGTERM or SIGINT
///
/// Returns the name of the signal received.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok("CTRL_C")
}
