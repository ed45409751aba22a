//! Per-request extension store behind [`Context::any`](crate::Context::any).
//!
//! Keys are opaque handles compared by identity: two keys built separately
//! never match, even with identical factories, so unrelated subsystems
//! cannot collide. Declare a key once and share it:
//!
//! ```rust,ignore
//! static SESSION: LazyLock<AnyKey> = LazyLock::new(|| {
//!     AnyKey::with_factory(|ctx: &Context| {
//!         let token = ctx.header("authorization").ok_or(Error::msg("no session"))?;
//!         Ok(Arc::new(Session::parse(&token)?) as Value)
//!     })
//! });
//!
//! let session = ctx.any_as::<Session>(&SESSION)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::warn;

use crate::context::Context;
use crate::error::Error;
use crate::scope::Value;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Builds the value for an [`AnyKey`] the first time a context asks for it.
pub trait Factory: Send + Sync + 'static {
    fn build(&self, ctx: &Context) -> Result<Value, Error>;
}

impl<F> Factory for F
where
    F: Fn(&Context) -> Result<Value, Error> + Send + Sync + 'static,
{
    fn build(&self, ctx: &Context) -> Result<Value, Error> {
        self(ctx)
    }
}

/// Identity key for the extension store.
///
/// Clones share the identity of the original.
#[derive(Clone)]
pub struct AnyKey {
    id: u64,
    factory: Option<Arc<dyn Factory>>,
}

impl AnyKey {
    /// A key without a factory: only [`Context::set_any`] fills it.
    pub fn new() -> Self {
        Self { id: NEXT_KEY.fetch_add(1, Ordering::Relaxed), factory: None }
    }

    pub fn with_factory(factory: impl Factory) -> Self {
        Self {
            id: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            factory: Some(Arc::new(factory)),
        }
    }
}

impl Default for AnyKey {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for AnyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyKey")
            .field("id", &self.id)
            .field("factory", &self.factory.is_some())
            .finish()
    }
}

/// One key's value, plus the thread currently running its factory.
#[derive(Default)]
struct Slot {
    value: Mutex<Option<Value>>,
    builder: Mutex<Option<ThreadId>>,
}

impl Slot {
    fn building_here(&self) -> bool {
        *self.builder.lock() == Some(thread::current().id())
    }
}

/// Clears the builder mark, also when the factory panics.
struct Building<'a>(&'a Slot);

impl<'a> Building<'a> {
    fn start(slot: &'a Slot) -> Self {
        *slot.builder.lock() = Some(thread::current().id());
        Self(slot)
    }
}

impl Drop for Building<'_> {
    fn drop(&mut self) {
        *self.0.builder.lock() = None;
    }
}

/// One exclusive slot per key: the outer lock is held only long enough to
/// find the slot, the slot lock is held across the factory call. Concurrent
/// first lookups of one key run its factory once; other keys never wait.
#[derive(Default)]
pub(crate) struct Store {
    slots: Mutex<HashMap<u64, Arc<Slot>>>,
}

impl Store {
    fn slot(&self, key: &AnyKey) -> Arc<Slot> {
        Arc::clone(self.slots.lock().entry(key.id).or_default())
    }

    /// A factory that looks up its own key gets [`Error::ReentrantKey`].
    pub(crate) fn get(&self, key: &AnyKey, ctx: &Context) -> Result<Value, Error> {
        let slot = self.slot(key);
        if slot.building_here() {
            return Err(Error::ReentrantKey);
        }
        let mut guard = slot.value.lock();
        if let Some(value) = guard.as_ref() {
            return Ok(Arc::clone(value));
        }
        let factory = key.factory.as_ref().ok_or(Error::NonExistentKey)?;
        let value = {
            let _building = Building::start(&slot);
            factory.build(ctx)?
        };
        *guard = Some(Arc::clone(&value));
        Ok(value)
    }

    /// Inside the key's own factory the store is skipped: the factory's
    /// result is what gets stored.
    pub(crate) fn set(&self, key: &AnyKey, value: Value) {
        let slot = self.slot(key);
        if slot.building_here() {
            warn!(key = key.id, "set_any on a key from inside its own factory; ignored");
            return;
        }
        *slot.value.lock() = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_distinct_but_clones_match() {
        let a = AnyKey::new();
        let b = AnyKey::new();
        assert_ne!(a.id, b.id);
        assert_eq!(a.clone().id, a.id);
    }

    fn ctx() -> Context {
        let req = http::Request::builder().uri("/").body(bytes::Bytes::new()).unwrap();
        Context::new(Arc::new(crate::App::new()), req, None)
    }

    #[test]
    fn factory_looking_up_its_own_key_fails_instead_of_hanging() {
        static KEY: std::sync::LazyLock<AnyKey> = std::sync::LazyLock::new(|| {
            AnyKey::with_factory(|ctx: &Context| {
                assert!(matches!(ctx.any(&KEY), Err(Error::ReentrantKey)));
                ctx.set_any(&KEY, "from inside");
                Ok(Arc::new("built") as Value)
            })
        });

        let ctx = ctx();
        assert_eq!(*ctx.any_as::<&str>(&KEY).unwrap(), "built");
        assert_eq!(*ctx.any_as::<&str>(&KEY).unwrap(), "built");
    }

    #[test]
    fn factory_may_use_other_keys() {
        let inner = AnyKey::with_factory(|_: &Context| Ok(Arc::new(2u32) as Value));
        let outer = AnyKey::with_factory({
            let inner = inner.clone();
            move |ctx: &Context| {
                let n = ctx.any_as::<u32>(&inner)?;
                Ok(Arc::new(*n * 10) as Value)
            }
        });

        let ctx = ctx();
        assert_eq!(*ctx.any_as::<u32>(&outer).unwrap(), 20);
    }
}
