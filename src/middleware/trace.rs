use std::time::Instant;

use tracing::info;

use crate::context::Context;
use crate::error::Error;

/// Logs one `info` event per request when its response is finalized.
///
/// Register it first so the latency covers the whole chain:
///
/// ```rust,no_run
/// use sprocket::{App, middleware};
///
/// let app = App::new().use_middleware(middleware::trace);
/// ```
///
/// Requests ended with `ctx.cancel()` skip after-hooks and are not logged.
pub async fn trace(ctx: Context) -> Result<(), Error> {
    let start = Instant::now();
    ctx.after(move |ctx| {
        info!(
            method = ctx.method(),
            path = ctx.path(),
            status = ctx.response_status().as_u16(),
            latency_us = start.elapsed().as_micros() as u64,
            "request"
        );
    })
}
