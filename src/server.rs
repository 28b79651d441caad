//! Relay server
//!
//! Owns the listener and the accept loop. Each accepted stream is handed
//! to [`admit`], and when the stop signal fires the listener is closed and
//! the [`ShutdownCoordinator`] drains every worker.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::table::SlotTable;
use crate::worker::{admit, WorkerContext};

pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<WorkerContext>,
    stop: CancellationToken,
}

/// Cloneable handle for stopping a running server and inspecting its table
#[derive(Clone)]
pub struct ServerHandle {
    table: Arc<SlotTable>,
    stop: CancellationToken,
}

impl ServerHandle {
    /// Request shutdown; further calls have no effect
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn table(&self) -> &Arc<SlotTable> {
        &self.table
    }
}

impl RelayServer {
    /// Bind a listener and build the slot table
    ///
    /// Setup failures here are the only ones allowed to end the process.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(listener, config)
    }

    pub fn new(listener: TcpListener, config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            listener,
            ctx: Arc::new(WorkerContext::new(config)),
            stop: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            table: Arc::clone(&self.ctx.table),
            stop: self.stop.clone(),
        }
    }

    /// Accept connections until `shutdown` resolves or a handle stops us
    pub async fn run_until<F>(self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            listener,
            ctx,
            stop,
        } = self;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = stop.cancelled() => break,
                result = listener.accept() => handle_accept_result(result, &ctx),
            }
        }

        drop(listener);
        info!("Listener closed");

        let coordinator = ShutdownCoordinator::new(Arc::clone(&ctx.table), ctx.tracker.clone());
        let report = coordinator.shutdown().await;
        info!("Chat relay terminated.....");
        report
    }

    pub async fn run_until_ctrl_c(self) -> ShutdownReport {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                // Without a signal handler the server runs until stopped via a handle.
                std::future::pending::<()>().await;
            }
            info!("Interrupt received");
            tokio::spawn(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Shutdown already in progress, ignoring interrupt");
                }
            });
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, ctx: &Arc<WorkerContext>) {
    match result {
        Ok((stream, peer)) => {
            debug!("New TCP connection from {}", peer);
            match admit(stream, &peer.to_string(), ctx) {
                Ok(lease) => debug!("Connection from {} holds slot {}", peer, lease),
                // The stream was already dropped, so the peer sees it close.
                Err(e) => debug!("Connection from {} closed: {}", peer, e),
            }
        }
        Err(e) => error!("Failed to accept connection: {}", e),
    }
}
