//! Listener lifecycle for the ingress and bridge routers.
//!
//! Each router gets its own `HttpServer`: `start()` binds and spawns the
//! serve task, `shutdown()` stops accepting connections and waits for
//! in-flight requests.

use std::io;
use std::net::SocketAddr;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One axum server bound to one address.
pub struct HttpServer {
    name: &'static str,
    addr: SocketAddr,
    router: Option<Router>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HttpServer {
    pub fn new(name: &'static str, addr: SocketAddr, router: Router) -> Self {
        Self {
            name,
            addr,
            router: Some(router),
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Bind the listener and spawn the server. Returns the bound address,
    /// which differs from the configured one when port 0 was requested.
    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        let router = self.router.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "server already started")
        })?;

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| io::Error::new(e.kind(), format!("failed to bind {}: {}", self.addr, e)))?;
        let local = listener.local_addr()?;

        tracing::info!("{} listening on {}", self.name, local);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let name = self.name;
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                    tracing::info!("{} shutting down", name);
                })
                .await
            {
                tracing::error!("{} error: {}", name, e);
            }
        });

        self.handle = Some(handle);
        Ok(local)
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
