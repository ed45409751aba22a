//! TCP listener, connection tasks, and shutdown.
//!
//! Each accepted connection gets its own task speaking HTTP/1.1 or HTTP/2.
//! Every request on it is buffered and handed to [`App::handle`].
//!
//! Stopping, whether from a signal ([`Server::serve`]) or from
//! [`Listener::close`] ([`Server::start`]), closes the listening socket
//! first and then waits for the open connections to finish their
//! in-flight requests. Orchestrators that send SIGTERM and wait out a grace
//! period get a clean drain.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::app::{App, ServerHandle};
use crate::error::Error;

/// The HTTP server.
pub struct Server {
    addr: String,
}

impl Server {
    /// Configures the server to bind to `addr` (`host:port`) when it starts.
    /// Use port `0` for an ephemeral port.
    ///
    /// ```rust,no_run
    /// use sprocket::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Starts accepting connections and dispatching them through `app`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self, app: App) -> Result<(), Error> {
        let (listener, app) = self.open(app).await?;
        accept_loop(listener, app, shutdown_signal()).await;
        Ok(())
    }

    /// Binds and serves in a background task. The returned [`Listener`]
    /// reports the bound address and stops the server on
    /// [`close`](Listener::close).
    pub async fn start(self, app: App) -> Result<Listener, Error> {
        let (listener, app) = self.open(app).await?;
        let server = app.server().ok_or_else(|| Error::msg("server handle missing"))?;
        let stop = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, app, stop.clone().cancelled_owned()));
        Ok(Listener { server, stop, task })
    }

    async fn open(self, app: App) -> Result<(TcpListener, Arc<App>), Error> {
        let listener = TcpListener::bind(&self.addr).await?;
        let addr = listener.local_addr()?;

        // Shared across connection tasks without copying the pipeline.
        let app = Arc::new(app);
        app.install_server(ServerHandle::new(addr));

        info!(%addr, "sprocket listening");
        Ok((listener, app))
    }
}

/// A server started with [`Server::start`].
pub struct Listener {
    server: Arc<ServerHandle>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn addr(&self) -> SocketAddr {
        self.server.addr()
    }

    /// The handle requests see under
    /// [`SERVER_CONTEXT_KEY`](crate::SERVER_CONTEXT_KEY).
    pub fn server(&self) -> Arc<ServerHandle> {
        Arc::clone(&self.server)
    }

    /// Stops accepting, drains in-flight connections, and waits for the
    /// accept loop to exit.
    pub async fn close(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            error!("accept loop failed: {e}");
        }
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, app: Arc<App>, shutdown: impl Future<Output = ()>) {
    let mut conns = tokio::task::JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Stop accepting as soon as shutdown fires, even with a backlog.
            biased;

            () = &mut shutdown => {
                info!(open = conns.len(), "stopping, draining connections");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    conns.spawn(connection(Arc::clone(&app), stream, peer));
                }
                Err(e) => error!("accept failed: {e}"),
            },

            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }

    drop(listener);
    while conns.join_next().await.is_some() {}

    info!("sprocket stopped");
}

async fn connection(app: Arc<App>, stream: TcpStream, peer: SocketAddr) {
    let svc = service_fn(move |req| dispatch(Arc::clone(&app), req, peer));

    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), svc)
        .await
    {
        debug!(%peer, "connection closed with error: {e}");
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Collects the body and runs the pipeline.
///
/// The error type is [`Infallible`](std::convert::Infallible): every failure
/// becomes a response (400 for an unreadable body, the pipeline's own
/// statuses otherwise) so hyper never sees an error.
async fn dispatch(
    app: Arc<App>,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, std::convert::Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(peer = %remote_addr, "body read error: {e}");
            let mut res = http::Response::new(Full::new(Bytes::new()));
            *res.status_mut() = http::StatusCode::BAD_REQUEST;
            return Ok(res);
        }
    };

    let req = http::Request::from_parts(parts, body);
    Ok(app.handle(req, Some(remote_addr)).await)
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** and **SIGINT** (Ctrl-C).
/// On Windows only Ctrl-C is available. A handler that cannot be installed
/// is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` never resolves: on non-Unix platforms the SIGTERM arm is
    // effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
