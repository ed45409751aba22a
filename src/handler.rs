//! Middleware and handler traits, and their type erasure.
//!
//! # How middleware are stored
//!
//! The pipeline and the router hold middleware of *different* concrete
//! types in one `Vec`, so each one is erased behind `dyn Middleware`:
//!
//! ```text
//! async fn auth(ctx: Context) -> Result<(), Error> { … }   ← user writes this
//!        ↓ app.use_middleware(auth)
//! Arc::new(auth)                                           ← BoxedMiddleware
//!        ↓ at request time
//! mw.call(ctx.clone())                                     ← one vtable dispatch
//!        ↓
//! Box::pin(auth(ctx))                                      ← BoxFuture
//! ```
//!
//! Objects with their own dispatch logic (the [`Router`](crate::Router), or
//! any user type) implement [`Handler`] instead and are mounted as a single
//! step with [`App::use_handler`](crate::App::use_handler).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Error;

/// A heap-allocated, type-erased middleware future.
pub type BoxFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'static>>;

/// One step of a pipeline.
///
/// Implemented for every function or closure with the signature
///
/// ```text
/// async fn name(ctx: Context) -> Result<(), Error>
/// ```
///
/// Returning `Err`, or ending the context with `ctx.end(..)` /
/// `ctx.cancel()`, skips the rest of the chain.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> BoxFuture;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture {
        Box::pin(self(ctx))
    }
}

/// A shared, type-erased middleware.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// An object that serves a request as a whole, e.g. a router.
pub trait Handler: Send + Sync + 'static {
    fn serve(&self, ctx: Context) -> BoxFuture;
}

/// Adapter mounting a [`Handler`] as one pipeline step.
pub(crate) struct Mounted<H>(pub(crate) H);

impl<H: Handler> Middleware for Mounted<H> {
    fn call(&self, ctx: Context) -> BoxFuture {
        self.0.serve(ctx)
    }
}
