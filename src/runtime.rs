//! The runtime every promise belongs to.
//!
//! A [`Runtime`] is a cheap, cloneable handle around the scheduler, the
//! configuration and the diagnostics shared by the promises it creates. It is
//! single-threaded: promises, deferreds and the runtime itself are neither `Send`
//! nor `Sync`.
use std::{
    any::{Any, TypeId},
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    panic::Location,
    rc::Rc,
    time::Duration,
};

use tracing::{debug, error, trace};

use crate::{
    future::Tasks,
    handler::{HandlerRef, Rejection},
    resolution::ThenableCache,
    tracking::RejectionId,
    Config, Deferred, Error, IntoResolution, Promise, Reason, RejectionObserver, RejectionTracker,
    Resolution, Scheduler, State, TimerId, Trace, TurnQueue, Uncaught, Value,
};

type FatalHook = Rc<dyn Fn(&Uncaught)>;

struct RuntimeInner {
    config: Config,
    scheduler: Rc<dyn Scheduler>,
    observer: Rc<dyn RejectionObserver>,
    tracker: Option<Rc<RejectionTracker>>,
    next_rejection: Cell<u64>,
    thenables: ThenableCache,
    cycles: RefCell<HashMap<TypeId, Box<dyn Any>>>,
    fatal: RefCell<Option<FatalHook>>,
    tasks: Tasks,
    turns: Cell<u64>,
}

/// Owner of the turn queue and factory for promises.
///
/// # Examples
///
/// ```
/// use deferred_promise::{Error, Runtime};
///
/// let rt = Runtime::new();
/// let sum = rt.all(vec![rt.fulfilled::<i32, Error>(1), rt.call(|| Ok(2))]).then(|values| {
///     Ok(values.iter().sum::<i32>())
/// });
/// assert_eq!(rt.block_on(&sum), Ok(3));
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

/// Builder for a [`Runtime`] with a custom scheduler or rejection observer.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: Config,
    scheduler: Option<Rc<dyn Scheduler>>,
    observer: Option<Rc<dyn RejectionObserver>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Runs turns on `scheduler` instead of a private [`TurnQueue`].
    pub fn scheduler<S: Scheduler + 'static>(mut self, scheduler: Rc<S>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sends rejection events to `observer` instead of a private [`RejectionTracker`].
    pub fn observer<O: RejectionObserver + 'static>(mut self, observer: Rc<O>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Runtime {
        let clock = self.config.clock;
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Rc::new(TurnQueue::new(clock)) as Rc<dyn Scheduler>);
        let (observer, tracker) = match self.observer {
            Some(observer) => (observer, None),
            None => {
                let tracker = Rc::new(RejectionTracker::new());
                (tracker.clone() as Rc<dyn RejectionObserver>, Some(tracker))
            }
        };
        debug!(config = ?self.config, "runtime created");
        Runtime {
            inner: Rc::new(RuntimeInner {
                config: self.config,
                scheduler,
                observer,
                tracker,
                next_rejection: Cell::new(0),
                thenables: ThenableCache::default(),
                cycles: RefCell::new(HashMap::new()),
                fatal: RefCell::new(None),
                tasks: Tasks::default(),
                turns: Cell::new(0),
            }),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_config(config: Config) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The built-in tracker, unless a custom observer was installed.
    pub fn tracker(&self) -> Option<&RejectionTracker> {
        self.inner.tracker.as_deref()
    }

    /// Time on the scheduler's clock.
    pub fn now(&self) -> Duration {
        self.inner.scheduler.now()
    }

    /// Installs the hook that receives rejections escaping [`Promise::done`].
    /// Without one the runtime panics in the turn that raises them.
    pub fn on_fatal(&self, hook: impl Fn(&Uncaught) + 'static) {
        *self.inner.fatal.borrow_mut() = Some(Rc::new(hook));
    }

    pub(crate) fn raise(&self, uncaught: Uncaught) {
        error!(reason = %uncaught.reason, trace = %uncaught.trace, "uncaught rejection");
        let hook = self.inner.fatal.borrow().clone();
        match hook {
            Some(hook) => hook(&uncaught),
            None => panic!("{uncaught}"),
        }
    }

    pub(crate) fn tasks(&self) -> &Tasks {
        &self.inner.tasks
    }

    pub(crate) fn trace(&self, location: &'static Location<'static>, parent: Option<&Trace>) -> Trace {
        Trace::capture(self.inner.config.long_stack_traces, location, parent)
    }

    // Every task is followed by a poll of the spawned futures it woke, so a host
    // loop calling `Scheduler::run_turn` directly keeps them moving.
    pub(crate) fn schedule(&self, task: impl FnOnce() + 'static) {
        let inner = Rc::downgrade(&self.inner);
        self.inner.scheduler.schedule(Box::new(move || {
            task();
            if let Some(inner) = inner.upgrade() {
                Runtime { inner }.poll_woken();
            }
        }))
    }

    pub(crate) fn schedule_poll(&self, id: u64) {
        let runtime = Rc::downgrade(&self.inner);
        self.schedule(move || {
            if let Some(inner) = runtime.upgrade() {
                Runtime { inner }.poll_task(id)
            }
        });
    }

    fn poll_woken(&self) {
        for id in self.inner.tasks.drain_woken() {
            self.schedule_poll(id);
        }
    }

    pub(crate) fn schedule_after(&self, delay: Duration, task: impl FnOnce() + 'static) -> TimerId {
        self.inner.scheduler.schedule_after(delay, Box::new(task))
    }

    pub(crate) fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.scheduler.cancel_timer(id)
    }

    /// The handler a resolution settles to. Promises map to their own handler,
    /// thenables to a cached lazily assimilated one.
    pub(crate) fn handler_for<T: Value, E: Reason>(
        &self,
        resolution: Resolution<T, E>,
        trace: &Trace,
    ) -> HandlerRef<T, E> {
        match resolution {
            Resolution::Value(value) => HandlerRef::fulfilled(value),
            Resolution::Rejected(reason) => self.rejected_handler(reason, trace),
            Resolution::Promise(promise) => promise.handler().clone(),
            Resolution::Thenable(thenable) => self.inner.thenables.handler(thenable),
        }
    }

    pub(crate) fn rejected_handler<T: Value, E: Reason>(&self, reason: E, trace: &Trace) -> HandlerRef<T, E> {
        let id = self.inner.config.track_unhandled.then(|| {
            let id = RejectionId(self.inner.next_rejection.get());
            self.inner.next_rejection.set(id.0 + 1);
            self.inner.observer.rejected(id, &reason, trace);
            id
        });
        HandlerRef::rejected(Rejection { reason, id })
    }

    pub(crate) fn rejection_handled(&self, id: Option<RejectionId>) {
        if let Some(id) = id {
            self.inner.observer.handled(id);
        }
    }

    /// The rejected handler shared by every promise of this type that was resolved
    /// with itself. Each new cycle reports the shared rejection to the observer
    /// again, so a later unobserved cycle is tracked even if an earlier one was
    /// handled.
    pub(crate) fn vicious_cycle<T: Value, E: Reason>(&self) -> HandlerRef<T, E> {
        let key = TypeId::of::<HandlerRef<T, E>>();
        let cached = self
            .inner
            .cycles
            .borrow()
            .get(&key)
            .and_then(|handler| handler.downcast_ref::<HandlerRef<T, E>>())
            .cloned();
        if let Some(handler) = cached {
            if let Some(id) = handler.rejection_id() {
                debug!(id = id.0, "vicious cycle reported again");
                let reason = E::from(Error::ViciousCycle);
                self.inner.observer.rejected(id, &reason, &Trace::default());
            }
            return handler;
        }
        let handler = self.rejected_handler(E::from(Error::ViciousCycle), &Trace::default());
        self.inner
            .cycles
            .borrow_mut()
            .insert(key, Box::new(handler.clone()));
        handler
    }

    /// A new unresolved promise together with its resolver.
    #[track_caller]
    pub fn defer<T: Value, E: Reason>(&self) -> Deferred<T, E> {
        Deferred::new(self.clone(), self.trace(Location::caller(), None))
    }

    /// [`defer`](Self::defer) with a canceler for [`Promise::cancel`].
    #[track_caller]
    pub fn defer_cancelable<T: Value, E: Reason>(&self, on_cancel: impl FnOnce() + 'static) -> Deferred<T, E> {
        let deferred = self.defer();
        deferred.on_cancel(on_cancel);
        deferred
    }

    /// Coerces anything resolvable into a promise. A promise of this runtime is
    /// returned as is; a thenable is assimilated on first use.
    #[track_caller]
    pub fn resolve<T: Value, E: Reason>(&self, value: impl IntoResolution<T, E>) -> Promise<T, E> {
        self.resolve_at(value, Location::caller())
    }

    pub(crate) fn resolve_at<T: Value, E: Reason>(
        &self,
        value: impl IntoResolution<T, E>,
        location: &'static Location<'static>,
    ) -> Promise<T, E> {
        match value.into_resolution() {
            Resolution::Promise(promise) => promise,
            resolution => {
                let trace = self.trace(location, None);
                let handler = self.handler_for(resolution, &trace);
                Promise::from_handler(handler, self.clone(), trace)
            }
        }
    }

    #[track_caller]
    pub fn fulfilled<T: Value, E: Reason>(&self, value: T) -> Promise<T, E> {
        let trace = self.trace(Location::caller(), None);
        Promise::from_handler(HandlerRef::fulfilled(value), self.clone(), trace)
    }

    #[track_caller]
    pub fn reject<T: Value, E: Reason>(&self, reason: E) -> Promise<T, E> {
        let trace = self.trace(Location::caller(), None);
        let handler = self.rejected_handler(reason, &trace);
        Promise::from_handler(handler, self.clone(), trace)
    }

    /// Runs `f` in a later turn. Whatever it returns, including an `Err` or a
    /// panic, settles the returned promise.
    #[track_caller]
    pub fn call<T, E, F, R>(&self, f: F) -> Promise<T, E>
    where
        T: Value,
        E: Reason,
        F: FnOnce() -> R + 'static,
        R: IntoResolution<T, E>,
    {
        self.fulfilled::<(), E>(()).then(move |()| f())
    }

    /// A promise fulfilled once `duration` has passed on the scheduler's clock.
    #[track_caller]
    pub fn delay<E: Reason>(&self, duration: Duration) -> Promise<(), E> {
        let deferred = self.defer();
        let resolver = deferred.resolver();
        self.schedule_after(duration, move || resolver.fulfill(()));
        deferred.promise()
    }

    /// Runs a single turn. Returns `false` when there was nothing to run.
    pub fn turn(&self) -> bool {
        self.poll_woken();
        if !self.inner.scheduler.run_turn() {
            return false;
        }
        let turns = self.inner.turns.get() + 1;
        self.inner.turns.set(turns);
        trace!(turn = turns, "turn complete");
        true
    }

    fn over_limit(&self, ran: u64) -> Option<Error> {
        self.inner
            .config
            .max_turns
            .filter(|max| ran > *max)
            .map(Error::TurnLimit)
    }

    /// Runs turns until the queue and the timers are exhausted. Returns the number
    /// of turns run.
    pub fn run(&self) -> Result<u64, Error> {
        let mut ran = 0;
        while self.turn() {
            ran += 1;
            if let Some(err) = self.over_limit(ran) {
                return Err(err);
            }
        }
        debug!(turns = ran, "runtime idle");
        Ok(ran)
    }

    /// Runs turns until `promise` settles and returns its outcome. Observing a
    /// rejection this way counts as handling it.
    ///
    /// Fails with [`Error::Stalled`] when nothing is left to run while the
    /// promise is still pending.
    pub fn block_on<T: Value, E: Reason>(&self, promise: &Promise<T, E>) -> Result<T, E> {
        let mut listening = false;
        let mut ran = 0;
        loop {
            match promise.inspect() {
                State::Fulfilled(value) => return Ok(value),
                State::Rejected(reason) => {
                    promise.mark_handled();
                    return Err(reason);
                }
                State::Pending if !listening => {
                    promise.on_settled(|| {});
                    listening = true;
                }
                State::Pending => {}
            }
            if !self.turn() {
                return Err(E::from(Error::Stalled));
            }
            ran += 1;
            if let Some(err) = self.over_limit(ran) {
                return Err(E::from(err));
            }
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("turns", &self.inner.turns.get())
            .finish()
    }
}
