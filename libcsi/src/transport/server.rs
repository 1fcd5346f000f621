//! Service composition root: owns startup ordering and the server
//! lifecycle.
//!
//! ```text
//! CsiServer::prepare   Initializing → MountingVolumes
//!                      register SIGHUP, startup reconciliation, bind
//! BoundServer::serve   → Serving, reload worker, gRPC until shutdown
//!                      → ShuttingDown (drain) → Stopped
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::transport::Server;
use tower::limit::GlobalConcurrencyLimitLayer;
use tracing::{debug, error, info, warn};

use super::grpc::{ControllerService, IdentityService, NodeService};
use crate::config::{Endpoint, PluginConfig};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::lifecycle::{Lifecycle, ServerState};
use crate::node::CsiNode;
use crate::proto::controller_server::ControllerServer;
use crate::proto::identity_server::IdentityServer;
use crate::proto::node_server::NodeServer;
use crate::reconcile::MountReconciler;
use crate::reload::{
    ReloadHandle, ReloadRequests, listen_for_hangup, reload_channel, spawn_reload_worker,
};

/// A CSI plugin server that has not started yet.
pub struct CsiServer<T> {
    config: PluginConfig,
    handler: Arc<T>,
    reconciler: Arc<MountReconciler>,
    lifecycle: Lifecycle,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    pub fn new(config: PluginConfig, handler: Arc<T>, reconciler: Arc<MountReconciler>) -> Self {
        Self {
            config,
            handler,
            reconciler,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Shared handle on the server state, valid for the whole run.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Run the startup pass and bind the endpoint.
    ///
    /// The SIGHUP listener is registered first; signals arriving before
    /// [`BoundServer::serve`] are queued and handled once serving starts.
    /// Reconciliation failures are logged and never prevent serving; an
    /// invalid configuration or a bind failure is returned.
    pub async fn prepare(self) -> Result<BoundServer<T>, CsiError> {
        self.config.validate()?;
        self.lifecycle.transition(ServerState::MountingVolumes)?;

        let cancel = CancellationToken::new();
        let (reload, requests) = reload_channel();
        let hangup = if self.config.reload_on_hangup {
            Some(listen_for_hangup(reload.clone(), cancel.clone())?)
        } else {
            None
        };

        info!(role = %self.reconciler.role(), "running startup mount reconciliation");
        match self.reconciler.reconcile_startup().await {
            Ok(outcomes) => {
                let failed = outcomes.iter().filter(|o| !o.is_success()).count();
                info!(volumes = outcomes.len(), failed, "startup reconciliation finished");
            }
            Err(e) => error!(error = %e, "startup reconciliation failed, serving anyway"),
        }

        let listener = match Listener::bind(&self.config.endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };
        info!(endpoint = %listener.endpoint(), "CSI gRPC endpoint bound");

        Ok(BoundServer {
            config: self.config,
            handler: self.handler,
            reconciler: self.reconciler,
            lifecycle: self.lifecycle,
            cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            reload,
            requests,
            hangup,
            listener,
        })
    }

    /// [`Self::prepare`] then [`BoundServer::serve`].
    pub async fn run<F>(self, shutdown: F) -> Result<(), CsiError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.prepare().await?.serve(shutdown).await
    }
}

/// A server whose startup pass has run and whose endpoint is bound.
pub struct BoundServer<T> {
    config: PluginConfig,
    handler: Arc<T>,
    reconciler: Arc<MountReconciler>,
    lifecycle: Lifecycle,
    cancel: CancellationToken,
    /// Stops the SIGHUP listener if the server is dropped without serving.
    cancel_on_drop: DropGuard,
    reload: ReloadHandle,
    requests: ReloadRequests,
    hangup: Option<JoinHandle<()>>,
    listener: Listener,
}

impl<T> BoundServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Actual listen address; for `tcp://host:0` this carries the chosen
    /// port.
    pub fn local_endpoint(&self) -> Endpoint {
        self.listener.endpoint()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Handle for requesting reload passes without a signal.
    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    /// Serve Identity, Controller and Node until `shutdown` completes.
    ///
    /// After `shutdown` the server stops accepting connections and waits
    /// for in-flight calls and any running reload pass to finish.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), CsiError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            config,
            handler,
            reconciler,
            lifecycle,
            cancel,
            cancel_on_drop,
            reload,
            requests,
            hangup,
            listener,
        } = self;

        lifecycle.transition(ServerState::Serving)?;
        let worker = spawn_reload_worker(requests, reconciler, cancel);
        // The worker exits once the token fires; the handle is no longer needed.
        drop(reload);

        // One limit shared by every connection.
        let router = Server::builder()
            .layer(GlobalConcurrencyLimitLayer::new(config.max_workers))
            .add_service(IdentityServer::new(IdentityService::new(
                handler.clone(),
                lifecycle.subscribe(),
            )))
            .add_service(ControllerServer::new(ControllerService::new(handler.clone())))
            .add_service(NodeServer::new(NodeService::new(handler)));

        let signal = {
            let lifecycle = lifecycle.clone();
            async move {
                shutdown.await;
                info!("shutdown requested, draining in-flight calls");
                if let Err(e) = lifecycle.transition(ServerState::ShuttingDown) {
                    warn!(error = %e, "unexpected lifecycle state at shutdown");
                }
            }
        };

        let endpoint = listener.endpoint();
        info!(%endpoint, role = %config.role, "serving CSI Identity, Controller and Node");
        let result = match listener {
            Listener::Unix { stream, .. } => {
                router.serve_with_incoming_shutdown(stream, signal).await
            }
            Listener::Tcp { stream, .. } => {
                router.serve_with_incoming_shutdown(stream, signal).await
            }
        };

        // Stops the reload worker and the SIGHUP listener.
        drop(cancel_on_drop);
        match worker.await {
            Ok(passes) => debug!(passes, "reload worker joined"),
            Err(e) => warn!(error = %e, "reload worker panicked"),
        }
        if let Some(hangup) = hangup
            && let Err(e) = hangup.await
        {
            warn!(error = %e, "SIGHUP listener panicked");
        }

        if let Endpoint::Unix(path) = &endpoint {
            remove_socket(path).await;
        }

        // A transport error ends serving without the shutdown signal.
        if lifecycle.state() == ServerState::Serving {
            lifecycle.transition(ServerState::ShuttingDown)?;
        }
        lifecycle.transition(ServerState::Stopped)?;
        info!("CSI server stopped");

        result.map_err(CsiError::transport)
    }
}

/// Bound listener, ready to hand to tonic.
enum Listener {
    Unix {
        path: PathBuf,
        stream: UnixListenerStream,
    },
    Tcp {
        addr: SocketAddr,
        stream: TcpListenerStream,
    },
}

impl Listener {
    async fn bind(endpoint: &Endpoint) -> Result<Self, CsiError> {
        match endpoint {
            Endpoint::Unix(path) => {
                let listener = bind_unix(path).await?;
                Ok(Self::Unix {
                    path: path.clone(),
                    stream: UnixListenerStream::new(listener),
                })
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| {
                    CsiError::TransportError(format!("bind tcp://{addr}: {e}"))
                })?;
                let addr = listener.local_addr().map_err(CsiError::transport)?;
                Ok(Self::Tcp {
                    addr,
                    stream: TcpListenerStream::new(listener),
                })
            }
        }
    }

    fn endpoint(&self) -> Endpoint {
        match self {
            Self::Unix { path, .. } => Endpoint::Unix(path.clone()),
            Self::Tcp { addr, .. } => Endpoint::Tcp(*addr),
        }
    }
}

/// Bind a Unix socket, replacing a stale socket file but never one a live
/// server still answers on.
async fn bind_unix(path: &Path) -> Result<UnixListener, CsiError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            CsiError::TransportError(format!("create {}: {e}", parent.display()))
        })?;
    }

    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(CsiError::TransportError(format!(
                    "{} is in use by a running server",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "removing stale socket");
            tokio::fs::remove_file(path).await.map_err(|e| {
                CsiError::TransportError(format!("remove stale {}: {e}", path.display()))
            })?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CsiError::TransportError(format!(
                "stat {}: {e}",
                path.display()
            )));
        }
    }

    UnixListener::bind(path)
        .map_err(|e| CsiError::TransportError(format!("bind unix://{}: {e}", path.display())))
}

async fn remove_socket(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "socket removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove socket"),
    }
}
