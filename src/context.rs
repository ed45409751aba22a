//! The per-request [`Context`].
//!
//! One `Context` exists per inbound request. It is a cheap handle (an `Arc`
//! inside): middleware take it by value, and clones can be moved into
//! spawned tasks. All clones see the same request, the same staged
//! response, and the same cancellation tree.
//!
//! # Termination
//!
//! ```text
//!            ┌──────── end(code) ────────┐
//! running ───┤                           ├──▶ ended ──▶ pipeline writes the staged response
//!            └──── cancel() ─────────────┘
//!              (after-hooks discarded)      (root scope completes: every derived scope fires)
//! ```
//!
//! `end` runs the after-hooks first, in registration order. Either way the
//! transition happens once: later calls are no-ops.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use http::header::{HOST, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::error;

use crate::any::{AnyKey, Store};
use crate::app::App;
use crate::error::Error;
use crate::ip;
use crate::response::{ContentType, Staged};
use crate::scope::{CancelError, CancelHandle, Scope, Value};

/// A function run when the response is finalized, before the context is
/// marked ended.
pub type AfterHook = Box<dyn FnOnce(&Context) + Send + 'static>;

/// The per-request object: request accessors, response staging, the
/// cancellation tree root, and the extension store.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    app: Arc<App>,

    method: Method,
    host: String,
    path: String,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    remote: Option<SocketAddr>,

    params: RwLock<HashMap<String, String>>,
    query: OnceLock<HashMap<String, Vec<String>>>,
    ip: OnceLock<Option<IpAddr>>,
    store: Store,

    scope: Scope,
    /// Claimed by the first `end`/`cancel`; `ended` flips once the hooks ran.
    finishing: AtomicBool,
    ended: AtomicBool,
    hooks: Mutex<Option<Vec<AfterHook>>>,
    staged: Mutex<Staged>,
}

impl Context {
    /// Builds the context for one request.
    ///
    /// If the app carries an `AppTimeout` setting, the root scope gets a
    /// deadline of now + timeout, in which case this must run inside a
    /// Tokio runtime.
    pub fn new(app: Arc<App>, req: http::Request<Bytes>, remote: Option<SocketAddr>) -> Self {
        let (parts, body) = req.into_parts();
        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let deadline = app.timeout().map(|t| Instant::now() + t);

        Self {
            inner: Arc::new(Inner {
                scope: Scope::root(Arc::clone(&app), deadline),
                app,
                method: parts.method,
                host,
                path: decode_path(parts.uri.path()),
                uri: parts.uri,
                headers: parts.headers,
                body,
                remote,
                params: RwLock::new(HashMap::new()),
                query: OnceLock::new(),
                ip: OnceLock::new(),
                store: Store::default(),
                finishing: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                hooks: Mutex::new(Some(Vec::new())),
                staged: Mutex::new(Staged::default()),
            }),
        }
    }

    // ── Request ───────────────────────────────────────────────────────────────

    pub fn method(&self) -> &str { self.inner.method.as_str() }
    pub fn host(&self) -> &str { &self.inner.host }
    /// The percent-decoded path, as routed on. See [`raw_path`](Self::raw_path).
    pub fn path(&self) -> &str { &self.inner.path }
    pub fn raw_path(&self) -> &str { self.inner.uri.path() }
    pub fn uri(&self) -> &Uri { &self.inner.uri }
    pub fn headers(&self) -> &HeaderMap { &self.inner.headers }
    pub fn body(&self) -> &Bytes { &self.inner.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.inner.remote }
    pub fn raw_query(&self) -> &str { self.inner.uri.query().unwrap_or_default() }

    pub(crate) fn http_method(&self) -> &Method { &self.inner.method }

    /// Case-insensitive request header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// A path parameter captured by the router, or `""`.
    pub fn param(&self, name: &str) -> String {
        self.inner.params.read().get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn set_params(&self, params: HashMap<String, String>) {
        self.inner.params.write().extend(params);
    }

    /// First value of query parameter `key`, or `""`.
    pub fn query(&self, key: &str) -> &str {
        self.query_values(key)
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Every value of query parameter `key` in raw-query order; `None` when
    /// the key does not appear.
    pub fn query_values(&self, key: &str) -> Option<&[String]> {
        let query = self.inner.query.get_or_init(|| {
            let mut map: HashMap<String, Vec<String>> = HashMap::new();
            for (k, v) in url::form_urlencoded::parse(self.raw_query().as_bytes()) {
                map.entry(k.into_owned()).or_default().push(v.into_owned());
            }
            map
        });
        query.get(key).map(Vec::as_slice)
    }

    /// The client address, resolved once. See [`ip::resolve`].
    pub fn ip(&self) -> Option<IpAddr> {
        *self
            .inner
            .ip
            .get_or_init(|| ip::resolve(&self.inner.headers, self.inner.remote))
    }

    // ── Settings & extensions ─────────────────────────────────────────────────

    /// An app setting; `None` for unknown keys.
    pub fn setting(&self, key: &str) -> Option<Value> {
        self.inner.app.setting(key)
    }

    pub fn setting_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.setting(key)?.downcast().ok()
    }

    /// The value stored for `key` on this context, building it with the
    /// key's factory on first use.
    ///
    /// Repeated calls return the same `Arc`. A factory error is returned
    /// and not cached, so the next call retries. A key with no factory and
    /// no stored value fails with [`Error::NonExistentKey`].
    pub fn any(&self, key: &AnyKey) -> Result<Value, Error> {
        self.inner.store.get(key, self)
    }

    pub fn any_as<T: Any + Send + Sync>(&self, key: &AnyKey) -> Result<Arc<T>, Error> {
        self.any(key)?
            .downcast()
            .map_err(|_| Error::msg(format!("extension value is not a {}", std::any::type_name::<T>())))
    }

    /// Stores `value` for `key`, replacing any stored value and
    /// pre-empting the key's factory.
    pub fn set_any(&self, key: &AnyKey, value: impl Any + Send + Sync) {
        self.inner.store.set(key, Arc::new(value));
    }

    // ── Cancellation tree ─────────────────────────────────────────────────────

    /// The root scope of this request's cancellation tree.
    pub fn scope(&self) -> &Scope { &self.inner.scope }

    pub fn deadline(&self) -> Option<Instant> { self.inner.scope.deadline() }

    /// Resolves once the request has ended (or hit its deadline).
    pub fn done(&self) -> WaitForCancellationFutureOwned { self.inner.scope.done() }

    pub fn err(&self) -> Option<CancelError> { self.inner.scope.err() }

    /// A process-wide value such as the server handle under
    /// [`SERVER_CONTEXT_KEY`](crate::SERVER_CONTEXT_KEY).
    pub fn value(&self, key: &str) -> Option<Value> { self.inner.scope.value(key) }

    pub fn with_value(&self, key: &'static str, value: impl Any + Send + Sync) -> Scope {
        self.inner.scope.with_value(key, value)
    }

    pub fn with_cancel(&self) -> (Scope, CancelHandle) { self.inner.scope.with_cancel() }

    pub fn with_deadline(&self, at: Instant) -> (Scope, CancelHandle) {
        self.inner.scope.with_deadline(at)
    }

    pub fn with_timeout(&self, timeout: Duration) -> (Scope, CancelHandle) {
        self.inner.scope.with_timeout(timeout)
    }

    // ── Response staging ──────────────────────────────────────────────────────

    /// Stages the response status. Last write wins; ignored once ended.
    pub fn status(&self, code: u16) {
        self.stage(|staged| staged.status = code);
    }

    /// The staged status, `0` if none was set.
    pub fn staged_status(&self) -> u16 {
        self.inner.staged.lock().status
    }

    /// The status the response will carry if the context ended now.
    pub fn response_status(&self) -> StatusCode {
        self.inner.staged.lock().resolved_status()
    }

    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.stage(|staged| {
            staged.headers.insert(name, value);
        });
    }

    pub fn set_body(&self, body: impl Into<Bytes>) {
        let body = body.into();
        self.stage(|staged| staged.body = body);
    }

    /// Stages `code` and a `text/plain` body, then ends the context.
    pub fn text(&self, code: u16, body: impl Into<String>) -> Result<(), Error> {
        self.bytes(code, ContentType::Text, body.into())
    }

    /// Stages `code` and a typed body, then ends the context.
    pub fn bytes(&self, code: u16, content_type: ContentType, body: impl Into<Bytes>) -> Result<(), Error> {
        let body = body.into();
        self.stage(|staged| {
            staged.status = code;
            staged.set_content(content_type, body);
        });
        self.end(0)
    }

    fn stage(&self, f: impl FnOnce(&mut Staged)) {
        let mut staged = self.inner.staged.lock();
        if !self.is_ended() {
            f(&mut staged);
        }
    }

    pub(crate) fn take_staged(&self) -> Staged {
        std::mem::take(&mut *self.inner.staged.lock())
    }

    // ── Termination ───────────────────────────────────────────────────────────

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Registers a hook to run when the response is finalized.
    ///
    /// Hooks run in registration order, on the normal path and after a
    /// middleware error, but not after [`cancel`](Self::cancel).
    pub fn after(&self, hook: impl FnOnce(&Context) + Send + 'static) -> Result<(), Error> {
        match self.inner.hooks.lock().as_mut() {
            Some(hooks) => {
                hooks.push(Box::new(hook));
                Ok(())
            }
            None => Err(Error::Ended),
        }
    }

    /// Number of pending after-hooks; `None` once they have been run or
    /// discarded.
    pub fn after_hooks(&self) -> Option<usize> {
        self.inner.hooks.lock().as_ref().map(Vec::len)
    }

    /// Stages `code` (when nonzero), runs the after-hooks and ends the
    /// context. Remaining middleware are skipped and the pipeline writes the
    /// staged response.
    pub fn end(&self, code: u16) -> Result<(), Error> {
        if code != 0 {
            self.status(code);
        }
        self.terminate(true);
        Ok(())
    }

    /// Ends the context immediately, discarding the after-hooks. Every
    /// derived scope completes with [`CancelError::Canceled`] unless it
    /// already completed on its own.
    pub fn cancel(&self) {
        self.terminate(false);
    }

    /// Returns `false` when another caller already terminated.
    pub(crate) fn terminate(&self, run_hooks: bool) -> bool {
        if self.inner.finishing.swap(true, Ordering::AcqRel) {
            return false;
        }
        let hooks = self.inner.hooks.lock().take().unwrap_or_default();
        if run_hooks {
            for hook in hooks {
                // A failing hook must not leave the context half-terminated.
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| hook(self))) {
                    error!(
                        method = self.method(),
                        path = self.path(),
                        panic = %panic_message(panic.as_ref()),
                        "after-hook panicked"
                    );
                }
            }
        }
        {
            let _staged = self.inner.staged.lock();
            self.inner.ended.store(true, Ordering::Release);
        }
        self.inner.scope.cancel(CancelError::Canceled);
        true
    }
}

/// Decodes `%XX` escapes. A path that does not decode to UTF-8 is kept raw.
fn decode_path(raw: &str) -> String {
    match percent_decode_str(raw).decode_utf8() {
        Ok(path) => path.into_owned(),
        Err(_) => raw.to_owned(),
    }
}

/// The text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.method())
            .field("host", &self.host())
            .field("path", &self.path())
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn ctx(method: &str, uri: &str) -> Context {
        let req = http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::new())
            .unwrap();
        Context::new(Arc::new(App::new()), req, None)
    }

    #[test]
    fn identity_from_request() {
        let ctx = ctx("GET", "http://example.com/foo?x=1");
        assert_eq!(ctx.method(), "GET");
        assert_eq!(ctx.host(), "example.com");
        assert_eq!(ctx.path(), "/foo");
        assert_eq!(ctx.raw_query(), "x=1");
    }

    #[test]
    fn path_is_percent_decoded() {
        let decoded = ctx("GET", "/files/a%20b/c%2Fd");
        assert_eq!(decoded.path(), "/files/a b/c/d");
        assert_eq!(decoded.raw_path(), "/files/a%20b/c%2Fd");

        let invalid = ctx("GET", "/bad/%FF");
        assert_eq!(invalid.path(), "/bad/%FF");
    }

    #[test]
    fn query_keeps_order_and_decodes() {
        let ctx = ctx("GET", "/view?id=123&name=a%20b&id=abc");
        assert_eq!(ctx.query("id"), "123");
        assert_eq!(ctx.query_values("id").unwrap(), ["123", "abc"]);
        assert_eq!(ctx.query("name"), "a b");
        assert_eq!(ctx.query("other"), "");
        assert!(ctx.query_values("other").is_none());
    }

    #[test]
    fn unknown_param_is_empty() {
        let ctx = ctx("GET", "/");
        ctx.set_params(HashMap::from([("id".to_owned(), "7".to_owned())]));
        assert_eq!(ctx.param("id"), "7");
        assert_eq!(ctx.param("ID"), "");
    }

    #[test]
    fn status_last_write_wins_until_ended() {
        let ctx = ctx("GET", "/");
        ctx.status(200);
        ctx.status(418);
        assert_eq!(ctx.staged_status(), 418);
        assert!(!ctx.is_ended());

        ctx.end(0).unwrap();
        ctx.status(500);
        assert_eq!(ctx.staged_status(), 418);
    }

    #[test]
    fn end_runs_hooks_in_order_once() {
        let ctx = ctx("GET", "/");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            ctx.after(move |_| order.lock().push(i)).unwrap();
        }
        assert_eq!(ctx.after_hooks(), Some(3));

        ctx.end(204).unwrap();
        ctx.end(500).unwrap();

        assert_eq!(*order.lock(), [0, 1, 2]);
        assert!(ctx.is_ended());
        assert_eq!(ctx.after_hooks(), None);
        assert_eq!(ctx.staged_status(), 204);
        assert!(matches!(ctx.after(|_| {}), Err(Error::Ended)));
    }

    #[test]
    fn hooks_may_adjust_the_response() {
        let ctx = ctx("GET", "/");
        ctx.after(|ctx| ctx.set_header(HeaderName::from_static("x-done"), HeaderValue::from_static("1")))
            .unwrap();
        ctx.end(200).unwrap();
        assert_eq!(ctx.take_staged().headers["x-done"], "1");
    }

    #[test]
    fn panicking_hook_still_ends_the_context() {
        let ctx = ctx("GET", "/");
        let ran = Arc::new(AtomicUsize::new(0));
        let (derived, _cancel) = ctx.with_cancel();

        ctx.after(|_| panic!("hook failed")).unwrap();
        let later = Arc::clone(&ran);
        ctx.after(move |_| {
            later.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        ctx.end(200).unwrap();

        assert!(ctx.is_ended());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.staged_status(), 200);
        assert!(derived.is_done());
        assert_eq!(ctx.err(), Some(CancelError::Canceled));
    }

    #[test]
    fn cancel_discards_hooks() {
        let ctx = ctx("GET", "/");
        let ran = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&ran);
        ctx.after(move |_| {
            probe.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        ctx.cancel();
        ctx.cancel();

        assert!(ctx.is_ended());
        assert_eq!(ctx.after_hooks(), None);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.err(), Some(CancelError::Canceled));
    }

    #[test]
    fn text_stages_and_ends() {
        let ctx = ctx("GET", "/");
        ctx.text(201, "made").unwrap();
        assert!(ctx.is_ended());
        let staged = ctx.take_staged();
        assert_eq!(staged.status, 201);
        assert_eq!(staged.body, "made");
    }

    #[test]
    fn host_header_beats_uri() {
        let req = http::Request::builder()
            .uri("/p")
            .header("host", "api.example.com:8080")
            .body(Bytes::new())
            .unwrap();
        let ctx = Context::new(Arc::new(App::new()), req, None);
        assert_eq!(ctx.host(), "api.example.com:8080");
    }
}
