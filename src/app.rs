//! The application: middleware pipeline, settings, process-wide values.
//!
//! # One request, start to finish
//!
//! ```text
//! Context::new ─▶ mw[0] ─▶ mw[1] ─▶ … ─▶ mw[n]        (stops early on Err, end, cancel, panic)
//!                                 │
//!                                 ▼
//!            stage error response (if a step failed)
//!                                 ▼
//!            run after-hooks ─▶ mark ended ─▶ root scope completes
//!                                 ▼
//!            staged status/headers/body ─▶ http::Response
//! ```
//!
//! Every path through the pipeline ends in the same finalization, so the
//! after-hooks always run (unless the request was cancelled) and every
//! derived scope always completes. A panicking after-hook is logged and
//! skipped; the remaining hooks still run.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use http::header::CONTENT_TYPE;
use http_body_util::Full;
use tokio::time::sleep_until;
use tracing::{debug, error, warn};

use crate::context::{Context, panic_message};
use crate::error::Error;
use crate::handler::{BoxedMiddleware, Handler, Middleware, Mounted};
use crate::middleware;
use crate::response::ContentType;
use crate::scope::{CancelError, Value};

/// Well-known settings keys.
pub mod settings {
    /// `String`. Defaults to `$APP_ENV`, or `"development"`.
    pub const APP_ENV: &str = "AppEnv";
    /// `std::time::Duration`. Per-request deadline; the pipeline answers
    /// `504 Gateway Timeout` when it expires.
    pub const APP_TIMEOUT: &str = "AppTimeout";
}

/// Key under which [`Context::value`] finds the running [`ServerHandle`].
pub const SERVER_CONTEXT_KEY: &str = "sprocket.server";

/// The server an [`App`] is running in, installed once when it binds.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
}

impl ServerHandle {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// The bound local address.
    pub fn addr(&self) -> SocketAddr { self.addr }
}

/// An ordered middleware pipeline plus the settings its requests can read.
///
/// ```rust,no_run
/// use sprocket::{App, Context, Error, Router, Server, middleware};
///
/// # async fn run() -> Result<(), Error> {
/// let router = Router::new().get("/users/:id", |ctx: Context| async move {
///     let id = ctx.param("id");
///     ctx.text(200, format!("user {id}"))
/// });
///
/// let app = App::new()
///     .use_middleware(middleware::trace)
///     .use_handler(router);
///
/// Server::bind("0.0.0.0:3000").serve(app).await
/// # }
/// ```
pub struct App {
    middleware: Vec<BoxedMiddleware>,
    settings: HashMap<String, Value>,
    server: OnceLock<Arc<ServerHandle>>,
}

impl App {
    pub fn new() -> Self {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_owned());
        Self {
            middleware: Vec::new(),
            settings: HashMap::new(),
            server: OnceLock::new(),
        }
        .set(settings::APP_ENV, env)
    }

    /// Appends a middleware to the pipeline.
    pub fn use_middleware(mut self, mw: impl Middleware) -> Self {
        self.middleware.push(Arc::new(mw));
        self
    }

    /// Mounts a [`Handler`] (typically a [`Router`](crate::Router)) as one
    /// pipeline step.
    pub fn use_handler(self, handler: impl Handler) -> Self {
        self.use_middleware(Mounted(handler))
    }

    /// Stores a setting. Settings are read-only once the app serves.
    pub fn set(mut self, key: impl Into<String>, value: impl Any + Send + Sync) -> Self {
        self.settings.insert(key.into(), Arc::new(value));
        self
    }

    pub fn setting(&self, key: &str) -> Option<Value> {
        self.settings.get(key).cloned()
    }

    /// The running server, once [`Server`](crate::Server) has bound.
    pub fn server(&self) -> Option<Arc<ServerHandle>> {
        self.server.get().cloned()
    }

    pub(crate) fn install_server(&self, handle: ServerHandle) -> Arc<ServerHandle> {
        Arc::clone(self.server.get_or_init(|| Arc::new(handle)))
    }

    /// Process-wide values reachable from every scope.
    pub(crate) fn value(&self, key: &str) -> Option<Value> {
        match key {
            SERVER_CONTEXT_KEY => self.server().map(|s| s as Value),
            _ => None,
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.setting(settings::APP_TIMEOUT)?
            .downcast::<Duration>()
            .ok()
            .map(|t| *t)
    }

    /// Runs one request through the pipeline and returns the response to
    /// write.
    pub async fn handle(
        self: Arc<Self>,
        req: http::Request<Bytes>,
        remote: Option<SocketAddr>,
    ) -> http::Response<Full<Bytes>> {
        let ctx = Context::new(Arc::clone(&self), req, remote);

        let chain = AssertUnwindSafe(middleware::run(&ctx, &self.middleware)).catch_unwind();
        let outcome = match ctx.deadline() {
            Some(at) => tokio::select! {
                res = chain => res,
                () = sleep_until(at) => {
                    ctx.scope().cancel(CancelError::DeadlineExceeded);
                    Ok(Err(Error::Canceled(CancelError::DeadlineExceeded)))
                }
            },
            None => chain.await,
        };

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => fail(&ctx, err),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(method = ctx.method(), path = ctx.path(), panic = %msg, "middleware panicked");
                fail(&ctx, Error::Panic(msg));
            }
        }

        ctx.terminate(true);
        let staged = ctx.take_staged();
        debug!(
            method = ctx.method(),
            path = ctx.path(),
            status = staged.resolved_status().as_u16(),
            "request finished"
        );
        staged.into_http()
    }
}

impl Default for App {
    fn default() -> Self { Self::new() }
}

/// Stages the response for a failed chain. A context that already ended
/// keeps the response it ended with.
fn fail(ctx: &Context, err: Error) {
    if ctx.is_ended() {
        debug!(method = ctx.method(), path = ctx.path(), %err, "error after end");
        return;
    }
    let status = err.status();
    if status.is_server_error() {
        warn!(method = ctx.method(), path = ctx.path(), %err, "middleware failed");
    }
    ctx.status(status.as_u16());
    ctx.set_header(CONTENT_TYPE, ContentType::Text.header_value());
    ctx.set_body(err.to_string());
}
