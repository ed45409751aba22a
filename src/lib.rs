//! # sprocket
//!
//! The request-lifecycle core of an HTTP middleware framework: a
//! per-request [`Context`], a cancellation tree hanging off it, a sequential
//! middleware pipeline with after-hooks, and a radix-tree [`Router`].
//!
//! ## The contract
//!
//! - A handler's response is written **once**. Middleware stage a status,
//!   headers and body; the pipeline writes them after the chain stops.
//! - The chain stops at the first `Err`, `ctx.end(..)`, `ctx.cancel()` or
//!   panic. After-hooks still run (except after `cancel`) and the response
//!   is still written.
//! - When a request ends, **every** scope derived from its context completes,
//!   however deep and whichever task holds it.
//!
//! What sprocket leaves to others: body codecs, templates, static files,
//! metrics. Handlers get bytes in and put bytes out.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use sprocket::{App, Context, Error, Router, Server, middleware};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let router = Router::new()
//!         .get("/users/:id",   get_user)
//!         .get("/files/:path*", get_file);
//!
//!     let app = App::new()
//!         .use_middleware(middleware::trace)
//!         .use_handler(router);
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await
//! }
//!
//! async fn get_user(ctx: Context) -> Result<(), Error> {
//!     // Give the downstream call two seconds, and no more than the
//!     // request itself lives.
//!     let (scope, _cancel) = ctx.with_timeout(Duration::from_secs(2));
//!     tokio::select! {
//!         () = scope.done() => Err(scope.err().unwrap_or(sprocket::CancelError::Canceled).into()),
//!         () = tokio::time::sleep(Duration::from_millis(5)) => {
//!             ctx.text(200, format!(r#"{{"id":"{}"}}"#, ctx.param("id")))
//!         }
//!     }
//! }
//!
//! async fn get_file(ctx: Context) -> Result<(), Error> {
//!     ctx.text(200, ctx.param("path"))
//! }
//! ```

mod any;
mod app;
mod context;
mod error;
mod handler;
mod response;
mod router;
mod scope;
mod server;

pub mod ip;
pub mod middleware;

pub use any::{AnyKey, Factory};
pub use app::{App, SERVER_CONTEXT_KEY, ServerHandle, settings};
pub use context::{AfterHook, Context};
pub use error::Error;
pub use handler::{BoxFuture, BoxedMiddleware, Handler, Middleware};
pub use response::ContentType;
pub use router::Router;
pub use scope::{CancelError, CancelHandle, Scope, Value};
pub use server::{Listener, Server};
