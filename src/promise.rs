use std::{fmt, panic::Location, time::Duration};

use tracing::debug;

use crate::{
    deferred::{Deferred, Resolver},
    handler::{CancelSignal, HandlerRef, Operation, Outcome, Then},
    resolution::catch_unwind,
    Error, IntoResolution, Reason, Resolution, Runtime, Trace, Uncaught, Value,
};

/// Synchronous snapshot of a promise, as returned by [`Promise::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> State<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, State::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, State::Rejected(_))
    }
}

/// A value that will be fulfilled or rejected in some later turn.
///
/// Promises are cheap handles: cloning one yields another handle to the same
/// settlement. Nothing on a promise can settle it; that takes the [`Deferred`]
/// or [`Resolver`] it came from.
///
/// Every continuation registered on a promise runs in a later turn of the
/// runtime's scheduler, never inside the call that registered it.
///
/// # Examples
///
/// ```
/// use deferred_promise::{Error, Promise, Runtime};
///
/// let rt = Runtime::new();
/// let deferred = rt.defer::<i32, Error>();
/// let doubled: Promise<i32> = deferred.promise().then(|v| Ok(v * 2));
/// deferred.fulfill(21);
/// assert!(doubled.is_pending());
/// assert_eq!(rt.block_on(&doubled), Ok(42));
/// ```
pub struct Promise<T, E = Error> {
    handler: HandlerRef<T, E>,
    runtime: Runtime,
    trace: Trace,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            runtime: self.runtime.clone(),
            trace: self.trace.clone(),
        }
    }
}

// Runs a user handler, turning a panic into a rejection.
fn invoke<U, E, R>(catch_panics: bool, f: impl FnOnce() -> R) -> Resolution<U, E>
where
    E: Reason,
    R: IntoResolution<U, E>,
{
    match catch_unwind(catch_panics, f) {
        Ok(resolution) => resolution.into_resolution(),
        Err(panic) => Resolution::Rejected(E::from(panic)),
    }
}

impl<T: Value, E: Reason> Promise<T, E> {
    pub(crate) fn from_handler(handler: HandlerRef<T, E>, runtime: Runtime, trace: Trace) -> Self {
        Self {
            handler,
            runtime,
            trace,
        }
    }

    pub(crate) fn handler(&self) -> &HandlerRef<T, E> {
        &self.handler
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Where this promise and its ancestors were created, when long stack traces
    /// are enabled.
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.handler.ptr_eq(&other.handler)
    }

    // Registers `reaction` for a later turn and returns the promise it settles.
    pub(crate) fn observe<U: Value>(
        &self,
        location: &'static Location<'static>,
        observes_rejection: bool,
        reaction: impl FnOnce(Outcome<T, E>, &Resolver<U, E>) + 'static,
    ) -> Promise<U, E> {
        let deferred = Deferred::new(
            self.runtime.clone(),
            self.runtime.trace(location, Some(&self.trace)),
        );
        let resolver = deferred.resolver();
        let then = Then::new(
            observes_rejection,
            Box::new(move |outcome| reaction(outcome, &resolver)),
        );
        let handler = self.handler.clone();
        let runtime = self.runtime.clone();
        self.runtime
            .schedule(move || handler.dispatch(Operation::Then(then), &runtime));
        deferred.promise()
    }

    /// Continues with the fulfillment value. A rejection passes through untouched.
    ///
    /// The handler may return a `Result` (an `Err` rejects the returned promise), a
    /// promise or a thenable, whose eventual state the returned promise adopts.
    #[track_caller]
    pub fn then<U, F, R>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Value,
        F: FnOnce(T) -> R + 'static,
        R: IntoResolution<U, E>,
    {
        let catch_panics = self.runtime.config().catch_panics;
        self.observe(Location::caller(), false, move |outcome, resolver| match outcome {
            Outcome::Fulfilled(value) => {
                resolver.resolve(invoke(catch_panics, move || on_fulfilled(value)))
            }
            Outcome::Rejected(rejection) => resolver.adopt(rejection),
        })
    }

    /// Continues with whichever handler matches the settlement. Exactly one of
    /// them runs, once.
    #[track_caller]
    pub fn then_or_else<U, F, G, R, S>(&self, on_fulfilled: F, on_rejected: G) -> Promise<U, E>
    where
        U: Value,
        F: FnOnce(T) -> R + 'static,
        G: FnOnce(E) -> S + 'static,
        R: IntoResolution<U, E>,
        S: IntoResolution<U, E>,
    {
        let catch_panics = self.runtime.config().catch_panics;
        self.observe(Location::caller(), true, move |outcome, resolver| match outcome {
            Outcome::Fulfilled(value) => {
                resolver.resolve(invoke(catch_panics, move || on_fulfilled(value)))
            }
            Outcome::Rejected(rejection) => {
                resolver.resolve(invoke(catch_panics, move || on_rejected(rejection.reason)))
            }
        })
    }

    /// Recovers from a rejection. A fulfillment passes through untouched.
    ///
    /// ```
    /// use deferred_promise::{Error, Promise, Runtime};
    ///
    /// let rt = Runtime::new();
    /// let failed: Promise<i32> = rt.reject(Error::msg("boom"));
    /// let recovered = failed.catch(|reason| Ok(reason.to_string().len() as i32));
    /// assert_eq!(rt.block_on(&recovered), Ok(4));
    /// ```
    #[track_caller]
    pub fn catch<G, S>(&self, on_rejected: G) -> Promise<T, E>
    where
        G: FnOnce(E) -> S + 'static,
        S: IntoResolution<T, E>,
    {
        let catch_panics = self.runtime.config().catch_panics;
        self.observe(Location::caller(), true, move |outcome, resolver| match outcome {
            Outcome::Fulfilled(value) => resolver.fulfill(value),
            Outcome::Rejected(rejection) => {
                resolver.resolve(invoke(catch_panics, move || on_rejected(rejection.reason)))
            }
        })
    }

    /// Runs `on_settled` after either outcome, waits for whatever it returns, then
    /// settles like this promise. A failure of `on_settled` replaces the outcome,
    /// and a rejection it replaces counts as handled.
    #[track_caller]
    pub fn finally<F, R>(&self, on_settled: F) -> Promise<T, E>
    where
        F: FnOnce() -> R + 'static,
        R: IntoResolution<(), E>,
    {
        let location = Location::caller();
        let runtime = self.runtime.clone();
        let catch_panics = runtime.config().catch_panics;
        self.observe(location, false, move |outcome, resolver| {
            let after: Promise<(), E> = runtime.resolve(invoke(catch_panics, on_settled));
            let runtime = runtime.clone();
            let settled = after.observe(location, false, move |done, next: &Resolver<T, E>| {
                match (done, outcome) {
                    (Outcome::Rejected(failure), Outcome::Rejected(replaced)) => {
                        runtime.rejection_handled(replaced.id);
                        next.adopt(failure)
                    }
                    (Outcome::Rejected(failure), Outcome::Fulfilled(_)) => next.adopt(failure),
                    (Outcome::Fulfilled(()), Outcome::Fulfilled(value)) => next.fulfill(value),
                    (Outcome::Fulfilled(()), Outcome::Rejected(rejection)) => next.adopt(rejection),
                }
            });
            resolver.resolve(settled);
        })
    }

    /// Ends the chain. A rejection reaching this point is raised as an
    /// [`Uncaught`] error in a fresh turn instead of staying in the chain.
    #[track_caller]
    pub fn done(&self) {
        self.terminate(Location::caller())
    }

    /// `then(on_fulfilled)` followed by [`done`](Self::done): an `Err` or panic in
    /// the handler escapes as well.
    #[track_caller]
    pub fn done_then<F, R>(&self, on_fulfilled: F)
    where
        F: FnOnce(T) -> R + 'static,
        R: IntoResolution<(), E>,
    {
        self.then(on_fulfilled).terminate(Location::caller())
    }

    /// `then_or_else` followed by [`done`](Self::done).
    #[track_caller]
    pub fn done_or_else<F, G, R, S>(&self, on_fulfilled: F, on_rejected: G)
    where
        F: FnOnce(T) -> R + 'static,
        G: FnOnce(E) -> S + 'static,
        R: IntoResolution<(), E>,
        S: IntoResolution<(), E>,
    {
        self.then_or_else(on_fulfilled, on_rejected)
            .terminate(Location::caller())
    }

    fn terminate(&self, location: &'static Location<'static>) {
        let runtime = self.runtime.clone();
        let trace = self.trace.clone();
        self.observe::<()>(location, true, move |outcome, _| {
            if let Outcome::Rejected(rejection) = outcome {
                let uncaught = Uncaught {
                    reason: format!("{:?}", rejection.reason),
                    trace: trace.to_string(),
                };
                let rt = runtime.clone();
                runtime.schedule(move || rt.raise(uncaught));
            }
        });
    }

    /// Runs `f` in the turn this promise's settlement is dispatched to it. Counts
    /// as handling a rejection.
    #[track_caller]
    pub(crate) fn on_settled(&self, f: impl FnOnce() + 'static) {
        self.observe::<()>(Location::caller(), true, move |_, _| f());
    }

    pub(crate) fn mark_handled(&self) {
        self.runtime.rejection_handled(self.handler.rejection_id());
    }

    /// Current state, without side effects.
    pub fn inspect(&self) -> State<T, E> {
        self.handler.state()
    }

    pub fn is_pending(&self) -> bool {
        self.inspect().is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        self.inspect().is_fulfilled()
    }

    pub fn is_rejected(&self) -> bool {
        self.inspect().is_rejected()
    }

    /// Asks the deferred at the root of this promise to give up, by running the
    /// callback registered with [`Deferred::on_cancel`].
    ///
    /// Returns whether a canceler ran. Promises derived with `then` and friends,
    /// already resolved deferreds and deferreds without a canceler ignore the
    /// request. Canceling does not settle the promise and says nothing to other
    /// observers; only the canceler decides what happens next.
    pub fn cancel(&self) -> Result<bool, Error> {
        let signal = CancelSignal::default();
        self.handler
            .dispatch(Operation::Cancel(signal.clone()), &self.runtime);
        signal.take().unwrap_or(Ok(false))
    }

    /// Fulfills with the same value `duration` after this promise fulfills.
    #[track_caller]
    pub fn delay(&self, duration: Duration) -> Promise<T, E> {
        let runtime = self.runtime.clone();
        self.then(move |value| runtime.delay::<E>(duration).then(move |()| Ok::<T, E>(value)))
    }

    /// Settles like this promise, or rejects with [`Error::TimedOut`] if that has not
    /// happened within `duration`.
    #[track_caller]
    pub fn timeout(&self, duration: Duration) -> Promise<T, E> {
        let location = Location::caller();
        let deferred = Deferred::new(
            self.runtime.clone(),
            self.runtime.trace(location, Some(&self.trace)),
        );
        let expired = deferred.resolver();
        let timer = self.runtime.schedule_after(duration, move || {
            debug!(?duration, "promise timed out");
            expired.reject(E::from(Error::TimedOut(duration)))
        });
        let runtime = self.runtime.clone();
        let resolver = deferred.resolver();
        self.observe::<()>(location, false, move |outcome, _| {
            runtime.cancel_timer(timer);
            match outcome {
                Outcome::Fulfilled(value) => resolver.fulfill(value),
                Outcome::Rejected(rejection) => resolver.adopt(rejection),
            }
        });
        deferred.promise()
    }
}

impl<A: Value, B: Value, E: Reason> Promise<(A, B), E> {
    /// `then` with the pair unpacked into two arguments.
    #[track_caller]
    pub fn spread<U, F, R>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Value,
        F: FnOnce(A, B) -> R + 'static,
        R: IntoResolution<U, E>,
    {
        self.then(move |(a, b)| on_fulfilled(a, b))
    }
}

impl<T: Value + fmt::Debug, E: Reason> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.inspect())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, RejectionTracker};
    use std::{cell::RefCell, rc::Rc};

    fn runtime() -> Runtime {
        Runtime::new()
    }

    #[test]
    fn test_then_is_never_synchronous() {
        let rt = runtime();
        let called = Rc::new(RefCell::new(false));
        let flag = called.clone();
        let settled: Promise<i32> = rt.fulfilled(1);
        let _next = settled.then(move |v| {
            *flag.borrow_mut() = true;
            Ok(v)
        });
        assert!(!*called.borrow());
        rt.run().unwrap();
        assert!(*called.borrow());
    }

    #[test]
    fn test_err_rejects_downstream() {
        let rt = runtime();
        let p: Promise<i32> = rt.fulfilled(1).then(|_| Err::<i32, _>(Error::msg("x")));
        assert_eq!(rt.block_on(&p), Err(Error::msg("x")));
    }

    #[test]
    fn test_panic_rejects_downstream() {
        let rt = runtime();
        let p: Promise<i32> = rt.fulfilled(1).then(|_| -> Result<i32, Error> { panic!("bad handler") });
        assert_eq!(rt.block_on(&p), Err(Error::Panicked("bad handler".into())));
    }

    #[test]
    fn test_handler_returning_promise_is_adopted() {
        let rt = runtime();
        let inner = rt.defer::<i32, Error>();
        let inner_promise = inner.promise();
        let p = rt.fulfilled::<i32, Error>(1).then(move |_| inner_promise);
        rt.run().unwrap();
        assert!(p.is_pending());
        inner.fulfill(5);
        assert_eq!(rt.block_on(&p), Ok(5));
    }

    #[test]
    fn test_rejection_passes_through_then() {
        let rt = runtime();
        let p: Promise<i32> = rt.reject(Error::msg("no"));
        let q = p.then(|v| Ok(v + 1)).then(|v| Ok(v * 2));
        assert_eq!(rt.block_on(&q), Err(Error::msg("no")));
    }

    #[test]
    fn test_then_or_else_runs_one_side() {
        let rt = runtime();
        let ok: Promise<i32> = rt.fulfilled(2);
        let a = ok.then_or_else(|v| Ok(v * 10), |_| Ok(-1));
        let failed: Promise<i32> = rt.reject(Error::msg("e"));
        let b = failed.then_or_else(|v| Ok(v * 10), |_| Ok(-1));
        assert_eq!(rt.block_on(&a), Ok(20));
        assert_eq!(rt.block_on(&b), Ok(-1));
    }

    #[test]
    fn test_catch_passes_fulfillment() {
        let rt = runtime();
        let p: Promise<i32> = rt.fulfilled(7);
        assert_eq!(rt.block_on(&p.catch(|_| Ok(0))), Ok(7));
    }

    #[test]
    fn test_finally_keeps_outcome() {
        let rt = runtime();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());
        let ok: Promise<i32> = rt.fulfilled(1);
        let ok = ok.finally(move || {
            a.borrow_mut().push("ok");
            Ok(())
        });
        let failed: Promise<i32> = rt.reject(Error::msg("e"));
        let failed = failed.finally(move || {
            b.borrow_mut().push("failed");
            Ok(())
        });
        assert_eq!(rt.block_on(&ok), Ok(1));
        assert_eq!(rt.block_on(&failed), Err(Error::msg("e")));
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_finally_waits_and_can_fail() {
        let rt = runtime();
        let gate = rt.defer::<(), Error>();
        let gate_promise = gate.promise();
        let p = rt.fulfilled::<i32, Error>(1).finally(move || gate_promise);
        rt.run().unwrap();
        assert!(p.is_pending());
        gate.fulfill(());
        assert_eq!(rt.block_on(&p), Ok(1));

        let q = rt
            .fulfilled::<i32, Error>(1)
            .finally(|| Err::<(), _>(Error::msg("cleanup failed")));
        assert_eq!(rt.block_on(&q), Err(Error::msg("cleanup failed")));
    }

    #[test]
    fn test_finally_failure_handles_replaced_rejection() {
        let tracker = Rc::new(RejectionTracker::new());
        let rt = Runtime::builder().observer(tracker.clone()).build();
        let original: Promise<i32> = rt.reject(Error::msg("orig"));
        let replaced = original.finally(|| Err::<(), _>(Error::msg("cleanup")));
        assert_eq!(rt.block_on(&replaced), Err(Error::msg("cleanup")));
        rt.run().unwrap();
        assert!(tracker.is_empty(), "{:?}", tracker.unhandled());

        let kept: Promise<i32> = rt.reject(Error::msg("kept"));
        let _passed = kept.finally(|| Ok(()));
        rt.run().unwrap();
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    #[should_panic(expected = "uncaught rejection")]
    fn test_done_raises_without_hook() {
        let rt = runtime();
        let p: Promise<i32> = rt.reject(Error::msg("fatal"));
        p.done();
        let _ = rt.run();
    }

    #[test]
    fn test_done_reports_to_hook() {
        let rt = runtime();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        rt.on_fatal(move |uncaught| sink.borrow_mut().push(uncaught.reason.clone()));
        rt.fulfilled::<i32, Error>(1)
            .done_then(|_| Err::<(), _>(Error::msg("late")));
        rt.fulfilled::<i32, Error>(1).done();
        rt.reject::<i32, Error>(Error::msg("recovered"))
            .done_or_else(|_| Ok(()), |_| Ok(()));
        rt.run().unwrap();
        assert_eq!(*seen.borrow(), ["Message(\"late\")"]);
    }

    #[test]
    fn test_done_raise_is_not_synchronous_with_handler() {
        let rt = runtime();
        let seen = Rc::new(RefCell::new(0));
        let sink = seen.clone();
        rt.on_fatal(move |_| *sink.borrow_mut() += 1);
        let p: Promise<i32> = rt.reject(Error::msg("x"));
        p.done();
        assert!(rt.turn());
        assert_eq!(*seen.borrow(), 0);
        rt.run().unwrap();
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn test_cancel_only_reaches_leaf() {
        let rt = runtime();
        let canceled = Rc::new(RefCell::new(0));
        let counter = canceled.clone();
        let deferred = rt.defer_cancelable::<i32, Error>(move || *counter.borrow_mut() += 1);
        let child = deferred.promise().then(|v| Ok(v + 1));
        assert_eq!(child.cancel(), Ok(false));
        assert_eq!(deferred.promise().cancel(), Ok(true));
        assert_eq!(deferred.promise().cancel(), Ok(false));
        assert_eq!(*canceled.borrow(), 1);
        assert!(deferred.promise().is_pending());
        deferred.fulfill(1);
        assert_eq!(rt.block_on(&child), Ok(2));
    }

    #[test]
    fn test_cancel_unassimilated_thenable_is_unsupported() {
        let rt = runtime();
        let foreign: Rc<dyn crate::Thenable<i32, Error>> =
            Rc::new(|_: Resolver<i32>| -> Result<(), Error> { Ok(()) });
        let p = rt.resolve(foreign);
        assert_eq!(p.cancel(), Err(Error::Unsupported("cancel")));
    }

    #[test]
    fn test_delay_and_timeout() {
        let rt = runtime();
        let slow: Promise<i32> = rt.fulfilled(1).delay(Duration::from_millis(50));
        let fast: Promise<i32> = rt.fulfilled(2).delay(Duration::from_millis(5));
        let timed_out = slow.timeout(Duration::from_millis(10));
        let in_time = fast.timeout(Duration::from_millis(10));
        assert_eq!(rt.block_on(&in_time), Ok(2));
        assert_eq!(
            rt.block_on(&timed_out),
            Err(Error::TimedOut(Duration::from_millis(10)))
        );
        assert_eq!(rt.block_on(&slow), Ok(1));
        assert!(rt.now() >= Duration::from_millis(50));
    }

    #[test]
    fn test_spread_pair() {
        let rt = runtime();
        let a: Promise<i32> = rt.fulfilled(3);
        let b: Promise<&str> = rt.fulfilled("x");
        let joined = rt.join(&a, &b).spread(|n, s| Ok(format!("{s}{n}")));
        assert_eq!(rt.block_on(&joined), Ok("x3".to_string()));
    }

    #[test]
    fn test_passthrough_keeps_rejection_identity() {
        let tracker = Rc::new(RejectionTracker::new());
        let rt = Runtime::builder().observer(tracker.clone()).build();
        let p: Promise<i32> = rt.reject(Error::msg("once"));
        let tail = p.then(|v| Ok(v)).then(|v| Ok(v));
        rt.run().unwrap();
        assert_eq!(tracker.len(), 1);
        let _handled = tail.catch(|_| Ok(0));
        rt.run().unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_long_stack_trace_is_stitched() {
        let config = Config {
            long_stack_traces: true,
            ..Config::default()
        };
        let rt = Runtime::with_config(config);
        let p: Promise<i32> = rt.fulfilled(1);
        let q = p.then(|v| Ok(v)).then(|v| Ok(v));
        assert_eq!(q.trace().locations().count(), 3);
        assert!(q.trace().to_string().contains(file!()));
    }
}
