//! Coercion of arbitrary resolution values into handlers.
use std::{
    any::{Any, TypeId},
    cell::RefCell,
    collections::HashMap,
    panic::AssertUnwindSafe,
    rc::{Rc, Weak},
};

use crate::{
    handler::{Handler, HandlerRef},
    Error, Promise, Reason, Resolver, Value,
};

/// A foreign promise-like object.
///
/// The engine calls [`then`](Thenable::then) at most once per coercion, in a later
/// turn, handing it a [`Resolver`] for the assimilated promise. An `Err` return (or
/// a panic) rejects that promise unless the resolver was already used.
///
/// Closures taking a [`Resolver`] are thenables:
///
/// ```
/// use deferred_promise::{Error, Resolver, Runtime, Thenable};
/// use std::rc::Rc;
///
/// let rt = Runtime::new();
/// let foreign: Rc<dyn Thenable<i32, Error>> = Rc::new(|resolver: Resolver<i32>| -> Result<(), Error> {
///     resolver.fulfill(10);
///     Ok(())
/// });
/// let promise = rt.resolve(foreign);
/// assert_eq!(rt.block_on(&promise), Ok(10));
/// ```
pub trait Thenable<T, E> {
    fn then(&self, resolver: Resolver<T, E>) -> Result<(), E>;
}

impl<T, E, F> Thenable<T, E> for F
where
    F: Fn(Resolver<T, E>) -> Result<(), E>,
{
    fn then(&self, resolver: Resolver<T, E>) -> Result<(), E> {
        self(resolver)
    }
}

/// Anything a promise can be resolved with.
pub enum Resolution<T, E = Error> {
    Value(T),
    Rejected(E),
    Promise(Promise<T, E>),
    Thenable(Rc<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    /// Whether this is one of the engine's own promises.
    pub fn is_promise(&self) -> bool {
        matches!(self, Resolution::Promise(_))
    }

    /// Whether this is a foreign thenable that still needs assimilation.
    pub fn is_thenable(&self) -> bool {
        matches!(self, Resolution::Thenable(_))
    }
}

/// Conversion into a [`Resolution`], implemented for the shapes handlers return.
///
/// An `Err` plays the part of a thrown exception: it rejects the derived promise.
pub trait IntoResolution<T, E> {
    fn into_resolution(self) -> Resolution<T, E>;
}

impl<T, E> IntoResolution<T, E> for Resolution<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        self
    }
}

impl<T, E> IntoResolution<T, E> for Result<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        match self {
            Ok(value) => Resolution::Value(value),
            Err(reason) => Resolution::Rejected(reason),
        }
    }
}

impl<T, E> IntoResolution<T, E> for Promise<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        Resolution::Promise(self)
    }
}

impl<T, E> IntoResolution<T, E> for &Promise<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        Resolution::Promise(self.clone())
    }
}

impl<T, E> IntoResolution<T, E> for Rc<dyn Thenable<T, E>> {
    fn into_resolution(self) -> Resolution<T, E> {
        Resolution::Thenable(self)
    }
}

/// Runs `f`, turning a panic into [`Error::Panicked`] when `enabled`.
pub(crate) fn catch_unwind<R>(enabled: bool, f: impl FnOnce() -> R) -> Result<R, Error> {
    if !enabled {
        return Ok(f());
    }
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(Error::from_panic)
}

trait CacheEntry {
    fn is_live(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

struct CachedThenable<T, E> {
    thenable: Weak<dyn Thenable<T, E>>,
    handler: Weak<RefCell<Handler<T, E>>>,
}

impl<T: 'static, E: 'static> CacheEntry for CachedThenable<T, E> {
    fn is_live(&self) -> bool {
        self.thenable.strong_count() > 0 && self.handler.strong_count() > 0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Remembers the handler made for each live thenable so a thenable coerced twice
/// has its `then` called only once.
#[derive(Default)]
pub(crate) struct ThenableCache {
    entries: RefCell<HashMap<(TypeId, usize), Box<dyn CacheEntry>>>,
}

fn address<T: ?Sized>(rc: &Rc<T>) -> usize {
    Rc::as_ptr(rc) as *const () as usize
}

impl ThenableCache {
    pub(crate) fn handler<T: Value, E: Reason>(&self, thenable: Rc<dyn Thenable<T, E>>) -> HandlerRef<T, E> {
        let key = (TypeId::of::<CachedThenable<T, E>>(), address(&thenable));
        let cached = self
            .entries
            .borrow()
            .get(&key)
            .and_then(|entry| entry.as_any().downcast_ref::<CachedThenable<T, E>>())
            .filter(|entry| {
                entry
                    .thenable
                    .upgrade()
                    .is_some_and(|known| address(&known) == key.1)
            })
            .and_then(|entry| HandlerRef::upgrade(&entry.handler));
        if let Some(handler) = cached {
            return handler;
        }
        let handler = HandlerRef::thenable(thenable.clone());
        let mut entries = self.entries.borrow_mut();
        entries.retain(|_, entry| entry.is_live());
        entries.insert(
            key,
            Box::new(CachedThenable {
                thenable: Rc::downgrade(&thenable),
                handler: handler.downgrade(),
            }),
        );
        handler
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;

    fn foreign(value: i32) -> Rc<dyn Thenable<i32, Error>> {
        Rc::new(move |resolver: Resolver<i32>| -> Result<(), Error> {
            resolver.fulfill(value);
            Ok(())
        })
    }

    #[test]
    fn test_into_resolution() {
        assert!(matches!(Ok::<_, Error>(1).into_resolution(), Resolution::Value(1)));
        assert!(matches!(
            Err::<i32, _>(Error::msg("x")).into_resolution(),
            Resolution::Rejected(Error::Message(_))
        ));
        assert!(foreign(1).into_resolution().is_thenable());
        assert!(!Resolution::<i32>::Value(1).is_promise());
    }

    #[test]
    fn test_cache_is_keyed_by_identity() {
        let cache = ThenableCache::default();
        let a = foreign(1);
        let b = foreign(1);
        let first = cache.handler(a.clone());
        assert!(cache.handler(a.clone()).ptr_eq(&first));
        assert!(!cache.handler(b).ptr_eq(&first));
        assert_eq!(first.state(), State::Pending);
    }

    #[test]
    fn test_cache_drops_dead_entries() {
        let cache = ThenableCache::default();
        let a = foreign(1);
        let handler = cache.handler(a.clone());
        drop(handler);
        drop(a);
        let _b = cache.handler(foreign(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_catch_unwind() {
        assert_eq!(catch_unwind(true, || 5), Ok(5));
        assert_eq!(
            catch_unwind(true, || -> i32 { panic!("nope") }),
            Err(Error::Panicked("nope".into()))
        );
    }
}
