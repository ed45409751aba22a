//! Middleware chains and built-in middleware.
//!
//! A chain runs strictly in order. Step `i + 1` runs only if step `i`
//! returned `Ok` and left the context open; an error or an explicit
//! `ctx.end(..)` / `ctx.cancel()` stops the chain.
//!
//! Built-in middleware:
//! - [`trace`] — one log line per request with method, path, status, latency

mod trace;

pub use trace::trace;

use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxedMiddleware;

/// Runs `chain` over `ctx` with short-circuit semantics.
pub(crate) async fn run(ctx: &Context, chain: &[BoxedMiddleware]) -> Result<(), Error> {
    for mw in chain {
        if ctx.is_ended() {
            break;
        }
        mw.call(ctx.clone()).await?;
    }
    Ok(())
}
