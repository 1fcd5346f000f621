//! Reconfiguration Trigger.
//!
//! SIGHUP (or any other producer holding a [`ReloadHandle`]) enqueues a
//! reload request; a single worker task consumes the queue and runs one
//! [`MountReconciler::reconcile_reload`] pass at a time.  The queue holds at
//! most one pending request, so a burst of signals received while a pass is
//! running collapses into exactly one follow-up pass.

use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::CsiError;
use crate::reconcile::MountReconciler;

/// Producer side of the reload queue.
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<()>,
}

/// Consumer side of the reload queue.
#[derive(Debug)]
pub struct ReloadRequests {
    rx: mpsc::Receiver<()>,
}

/// Create a reload queue.
pub fn reload_channel() -> (ReloadHandle, ReloadRequests) {
    let (tx, rx) = mpsc::channel(1);
    (ReloadHandle { tx }, ReloadRequests { rx })
}

impl ReloadHandle {
    /// Request a reload pass.  Returns `false` when the request was merged
    /// into one already pending, or when the worker has gone away.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("reload already pending, request coalesced");
                false
            }
            Err(TrySendError::Closed(())) => {
                debug!("reload worker stopped, request dropped");
                false
            }
        }
    }
}

impl ReloadRequests {
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Register a SIGHUP handler forwarding every signal to `handle` until
/// `cancel` fires.
///
/// Registration happens before this returns, so from then on SIGHUP no
/// longer terminates the process.
pub fn listen_for_hangup(
    handle: ReloadHandle,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, CsiError> {
    let mut hangup = signal(SignalKind::hangup())
        .map_err(|e| CsiError::Internal(format!("failed to register SIGHUP handler: {e}")))?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGHUP received, scheduling mount reload");
                    handle.request();
                }
            }
        }
        debug!("SIGHUP listener stopped");
    }))
}

/// Spawn the single consumer of `requests`.  The returned task resolves to
/// the number of passes it ran.
///
/// Cancellation is checked between passes; a pass that has started always
/// runs to completion.
pub fn spawn_reload_worker(
    mut requests: ReloadRequests,
    reconciler: Arc<MountReconciler>,
    cancel: CancellationToken,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut passes = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                }
            }

            passes += 1;
            match reconciler.reconcile_reload().await {
                Ok(outcomes) => {
                    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
                    info!(pass = passes, volumes = outcomes.len(), failed, "mount reload finished");
                }
                Err(e) => error!(pass = passes, error = %e, "mount reload failed"),
            }
        }
        debug!(passes, "reload worker stopped");
        passes
    })
}
