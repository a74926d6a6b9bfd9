use std::{cell::Cell, fmt, rc::Rc};

use tracing::trace;

use crate::{
    handler::{HandlerRef, Rejection},
    IntoResolution, Promise, Reason, Resolution, Runtime, Trace, Value,
};

/// The capability to settle one promise.
///
/// Cloneable; every clone shares the same "first call wins" latch, so a resolver
/// can be handed to several callbacks and only the first to fire has any effect.
pub struct Resolver<T, E = crate::Error> {
    handler: HandlerRef<T, E>,
    resolved: Rc<Cell<bool>>,
    runtime: Runtime,
    trace: Trace,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            resolved: self.resolved.clone(),
            runtime: self.runtime.clone(),
            trace: self.trace.clone(),
        }
    }
}

impl<T: Value, E: Reason> Resolver<T, E> {
    pub(crate) fn new(handler: HandlerRef<T, E>, runtime: Runtime, trace: Trace) -> Self {
        Self {
            handler,
            resolved: Rc::new(Cell::new(false)),
            runtime,
            trace,
        }
    }

    /// Resolves with a value, a rejection, another promise or a thenable. Calls
    /// after the first are ignored.
    pub fn resolve(&self, value: impl IntoResolution<T, E>) {
        if self.resolved.replace(true) {
            trace!("ignoring repeated resolution");
            return;
        }
        let next = self.runtime.handler_for(value.into_resolution(), &self.trace);
        self.handler.become_handler(next, &self.runtime);
    }

    pub fn fulfill(&self, value: T) {
        self.resolve(Resolution::Value(value))
    }

    pub fn reject(&self, reason: E) {
        self.resolve(Resolution::Rejected(reason))
    }

    /// Forwards an existing rejection without registering a new one.
    pub(crate) fn adopt(&self, rejection: Rejection<E>) {
        if self.resolved.replace(true) {
            return;
        }
        self.handler
            .become_handler(HandlerRef::rejected(rejection), &self.runtime);
    }

    /// Whether `resolve`, `fulfill` or `reject` has been called.
    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }
}

/// A promise together with the capability to settle it.
///
/// # Examples
///
/// ```
/// use deferred_promise::{Deferred, Runtime};
///
/// let rt = Runtime::new();
/// let deferred: Deferred<&str> = rt.defer();
/// let promise = deferred.promise();
/// deferred.fulfill("first");
/// deferred.fulfill("second");
/// assert_eq!(rt.block_on(&promise), Ok("first"));
/// ```
pub struct Deferred<T, E = crate::Error> {
    promise: Promise<T, E>,
    resolver: Resolver<T, E>,
}

impl<T: Value, E: Reason> Deferred<T, E> {
    pub(crate) fn new(runtime: Runtime, trace: Trace) -> Self {
        let handler = HandlerRef::pending();
        let resolver = Resolver::new(handler.clone(), runtime.clone(), trace.clone());
        Self {
            promise: Promise::from_handler(handler, runtime, trace),
            resolver,
        }
    }

    pub fn promise(&self) -> Promise<T, E> {
        self.promise.clone()
    }

    pub fn resolver(&self) -> Resolver<T, E> {
        self.resolver.clone()
    }

    pub fn resolve(&self, value: impl IntoResolution<T, E>) {
        self.resolver.resolve(value)
    }

    pub fn fulfill(&self, value: T) {
        self.resolver.fulfill(value)
    }

    pub fn reject(&self, reason: E) {
        self.resolver.reject(reason)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolver.is_resolved()
    }

    /// Registers the callback [`Promise::cancel`] runs while this deferred is
    /// unresolved. Returns `false` once the deferred has been resolved.
    pub fn on_cancel(&self, canceler: impl FnOnce() + 'static) -> bool {
        !self.is_resolved() && self.resolver.handler.set_canceler(Box::new(canceler))
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("resolved", &self.resolved.get())
            .finish()
    }
}
