//! Radix-tree request router.
//!
//! One tree per HTTP method, O(path-length) lookup via [`matchit`].
//!
//! # Patterns
//!
//! | Segment  | Matches                                          | Example            |
//! |----------|--------------------------------------------------|--------------------|
//! | `users`  | itself                                           | `/users`           |
//! | `:id`    | exactly one non-empty segment                    | `/users/:id`       |
//! | `:rest*` | everything left, slashes included (last only)    | `/files/:rest*`    |
//!
//! At each position a static segment beats a parameter, which beats a
//! wildcard. Two patterns that would be equally specific for the same input
//! (`/a/:x` and `/a/:y`) are rejected at registration.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;
use tracing::debug;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, BoxedMiddleware, Handler, Middleware};
use crate::middleware;

/// The application router. Mount it with
/// [`App::use_handler`](crate::App::use_handler).
///
/// Build it once at startup. Each registration returns `self` so calls
/// chain naturally.
///
/// ```rust,no_run
/// # use sprocket::{Context, Error, Router};
/// # async fn get_user(ctx: Context) -> Result<(), Error> { ctx.end(204) }
/// # async fn create_user(ctx: Context) -> Result<(), Error> { ctx.end(201) }
/// # async fn serve_file(ctx: Context) -> Result<(), Error> { ctx.end(200) }
/// Router::new()
///     .get("/users/:id",      get_user)
///     .post("/users",         create_user)
///     .get("/static/:path*",  serve_file);
/// ```
pub struct Router {
    root: String,
    routes: HashMap<Method, MatchitRouter<BoxedMiddleware>>,
    middleware: Vec<BoxedMiddleware>,
    otherwise: Option<BoxedMiddleware>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            root: String::new(),
            routes: HashMap::new(),
            middleware: Vec::new(),
            otherwise: None,
        }
    }

    /// A router that only serves paths under `prefix` and matches the rest
    /// of the path. Requests outside the prefix pass through untouched to
    /// the next pipeline step.
    pub fn with_root(prefix: &str) -> Self {
        Self { root: prefix.trim_end_matches('/').to_owned(), ..Self::new() }
    }

    /// Register a handler for a method + pattern pair. Returns `self` for
    /// chaining.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is malformed or conflicts with one already
    /// registered for `method`. Use [`try_on`](Self::try_on) to handle that
    /// as an error instead.
    pub fn on(self, method: Method, pattern: &str, handler: impl Middleware) -> Self {
        self.try_on(method, pattern, handler)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_on(mut self, method: Method, pattern: &str, handler: impl Middleware) -> Result<Self, Error> {
        let route = to_matchit(pattern)?;
        self.routes
            .entry(method)
            .or_default()
            .insert(route, Arc::new(handler) as BoxedMiddleware)
            .map_err(|e| Error::Route { pattern: pattern.to_owned(), reason: e.to_string() })?;
        Ok(self)
    }

    pub fn get(self, pattern: &str, handler: impl Middleware) -> Self {
        self.on(Method::GET, pattern, handler)
    }

    pub fn post(self, pattern: &str, handler: impl Middleware) -> Self {
        self.on(Method::POST, pattern, handler)
    }

    pub fn put(self, pattern: &str, handler: impl Middleware) -> Self {
        self.on(Method::PUT, pattern, handler)
    }

    pub fn patch(self, pattern: &str, handler: impl Middleware) -> Self {
        self.on(Method::PATCH, pattern, handler)
    }

    pub fn delete(self, pattern: &str, handler: impl Middleware) -> Self {
        self.on(Method::DELETE, pattern, handler)
    }

    pub fn head(self, pattern: &str, handler: impl Middleware) -> Self {
        self.on(Method::HEAD, pattern, handler)
    }

    pub fn options(self, pattern: &str, handler: impl Middleware) -> Self {
        self.on(Method::OPTIONS, pattern, handler)
    }

    /// Middleware run before the matched handler, for matched routes only.
    pub fn middleware(mut self, mw: impl Middleware) -> Self {
        self.middleware.push(Arc::new(mw));
        self
    }

    /// Handles requests that match no route instead of answering 404.
    pub fn otherwise(mut self, handler: impl Middleware) -> Self {
        self.otherwise = Some(Arc::new(handler));
        self
    }

    pub(crate) fn lookup(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(BoxedMiddleware, HashMap<String, String>)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let handler = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((handler, params))
    }

    /// The part of `path` this router matches against, or `None` when the
    /// path lies outside the root prefix.
    fn relative<'p>(&self, path: &'p str) -> Option<&'p str> {
        if self.root.is_empty() {
            return Some(path);
        }
        match path.strip_prefix(self.root.as_str())? {
            "" => Some("/"),
            rest if rest.starts_with('/') => Some(rest),
            _ => None,
        }
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

impl Handler for Router {
    fn serve(&self, ctx: Context) -> BoxFuture {
        let Some(path) = self.relative(ctx.path()) else {
            return Box::pin(async { Ok(()) });
        };

        match self.lookup(ctx.http_method(), path) {
            Some((handler, params)) => {
                ctx.set_params(params);
                let mut chain = self.middleware.clone();
                chain.push(handler);
                Box::pin(async move { middleware::run(&ctx, &chain).await })
            }
            None => match &self.otherwise {
                Some(fallback) => fallback.call(ctx),
                None => {
                    debug!(method = ctx.method(), path = ctx.path(), "no route");
                    let err = Error::not_found(ctx.path());
                    Box::pin(async move { Err(err) })
                }
            },
        }
    }
}

/// Translates `:name` / `:name*` segments into matchit's `{name}` /
/// `{*name}`.
fn to_matchit(pattern: &str) -> Result<String, Error> {
    let invalid = |reason: &str| Error::Route { pattern: pattern.to_owned(), reason: reason.to_owned() };

    if !pattern.starts_with('/') {
        return Err(invalid("pattern must start with `/`"));
    }

    let segments: Vec<&str> = pattern[1..].split('/').collect();
    let mut out = String::with_capacity(pattern.len() + 8);
    for (i, segment) in segments.iter().enumerate() {
        out.push('/');
        let Some(name) = segment.strip_prefix(':') else {
            out.push_str(segment);
            continue;
        };
        match name.strip_suffix('*') {
            Some(_) if i + 1 != segments.len() => {
                return Err(invalid("wildcard must be the last segment"));
            }
            Some("") => return Err(invalid("wildcard needs a name")),
            Some(wild) => {
                out.push_str("{*");
                out.push_str(wild);
                out.push('}');
            }
            None if name.is_empty() => return Err(invalid("parameter needs a name")),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
    }
    Ok(out)
}
