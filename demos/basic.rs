//! Minimal sprocket example: routing, after-hooks, and a derived timeout.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl http://localhost:3000/files/docs/readme.md
//!   curl -H 'X-Forwarded-For: 203.0.113.7' http://localhost:3000/whoami
//!   curl http://localhost:3000/slow

use std::time::Duration;

use sprocket::{App, Context, ContentType, Error, Router, Server, middleware, settings};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let api = Router::new()
        .get("/users/:id",    get_user)
        .post("/users",       create_user)
        .delete("/users/:id", delete_user)
        .get("/files/:path*", get_file)
        .get("/whoami",       whoami)
        .get("/slow",         slow);

    let app = App::new()
        .set(settings::APP_TIMEOUT, Duration::from_secs(5))
        .use_middleware(middleware::trace)
        .use_handler(api);

    Server::bind("0.0.0.0:3000").serve(app).await
}

// GET /users/:id
async fn get_user(ctx: Context) -> Result<(), Error> {
    let id = ctx.param("id");
    ctx.bytes(200, ContentType::Json, format!(r#"{{"id":"{id}","name":"alice"}}"#))
}

// POST /users
//
// ctx.body() is the raw request body; sprocket does not decode it.
async fn create_user(ctx: Context) -> Result<(), Error> {
    if ctx.body().is_empty() {
        return ctx.end(400);
    }
    ctx.set_header(http::header::LOCATION, http::HeaderValue::from_static("/users/99"));
    ctx.bytes(201, ContentType::Json, r#"{"id":"99","name":"new_user"}"#)
}

// DELETE /users/:id → 204 No Content
async fn delete_user(ctx: Context) -> Result<(), Error> {
    ctx.end(204)
}

// GET /files/:path*
async fn get_file(ctx: Context) -> Result<(), Error> {
    ctx.text(200, format!("would serve {}", ctx.param("path")))
}

// GET /whoami
async fn whoami(ctx: Context) -> Result<(), Error> {
    let ip = ctx.ip().map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_owned());
    ctx.text(200, ip)
}

// GET /slow → gives up after 100 ms, or when the request ends.
async fn slow(ctx: Context) -> Result<(), Error> {
    let (scope, _cancel) = ctx.with_timeout(Duration::from_millis(100));
    tokio::select! {
        () = scope.done() => ctx.text(503, format!("gave up: {}", scope.err().map(|e| e.to_string()).unwrap_or_default())),
        () = tokio::time::sleep(Duration::from_secs(1)) => ctx.text(200, "finished"),
    }
}
