//! The resolution state behind every promise.
//!
//! A handler is either terminal (`Fulfilled`, `Rejected`), waiting (`Pending`,
//! collecting dispatches), an unassimilated foreign `Thenable`, or a forwarding
//! link (`Became`) to a more resolved handler. Links only ever point forward and
//! are followed iteratively.
use std::{
    any::Any,
    cell::{Cell, RefCell},
    marker::PhantomData,
    rc::{Rc, Weak},
};

use tracing::{debug, trace};

use crate::{
    deferred::Resolver,
    resolution::{catch_unwind, Thenable},
    tracking::RejectionId,
    Error, Reason, Runtime, State, Trace, Value,
};

#[derive(Clone)]
pub(crate) struct Rejection<E> {
    pub(crate) reason: E,
    pub(crate) id: Option<RejectionId>,
}

pub(crate) enum Outcome<T, E> {
    Fulfilled(T),
    Rejected(Rejection<E>),
}

pub(crate) type Reaction<T, E> = Box<dyn FnOnce(Outcome<T, E>)>;

thread_local! {
    static GARBAGE: RefCell<Vec<Box<dyn Any>>> = const { RefCell::new(Vec::new()) };
    static COLLECTING: Cell<bool> = const { Cell::new(false) };
}

// Drops `garbage` without nesting: a drop started while another one is being
// collected is queued and run by the outermost call instead.
fn drop_later(garbage: Box<dyn Any>) {
    if GARBAGE.try_with(|queue| queue.borrow_mut().push(garbage)).is_err() {
        return;
    }
    if COLLECTING.with(|collecting| collecting.replace(true)) {
        return;
    }
    while let Some(next) = GARBAGE.with(|queue| queue.borrow_mut().pop()) {
        drop(next);
    }
    COLLECTING.with(|collecting| collecting.set(false));
}

/// A registered continuation. `observes_rejection` is set when the caller supplied
/// a rejection handler, which is what marks a rejection as handled.
///
/// The reaction is stored erased. It usually owns the resolver of the next
/// promise in a chain, so dropping it goes through `drop_later`.
pub(crate) struct Then<T, E> {
    reaction: Option<Box<dyn Any>>,
    observes_rejection: bool,
    outcome: PhantomData<fn(Outcome<T, E>)>,
}

impl<T, E> Drop for Then<T, E> {
    fn drop(&mut self) {
        if let Some(reaction) = self.reaction.take() {
            drop_later(reaction);
        }
    }
}

impl<T: Value, E: Reason> Then<T, E> {
    pub(crate) fn new(observes_rejection: bool, reaction: Reaction<T, E>) -> Self {
        Self {
            reaction: Some(Box::new(reaction)),
            observes_rejection,
            outcome: PhantomData,
        }
    }

    fn settle(mut self, outcome: Outcome<T, E>, runtime: &Runtime) {
        if let Outcome::Rejected(rejection) = &outcome {
            if self.observes_rejection {
                runtime.rejection_handled(rejection.id);
            }
        }
        let reaction = self
            .reaction
            .take()
            .and_then(|reaction| reaction.downcast::<Reaction<T, E>>().ok());
        if let Some(reaction) = reaction {
            let reaction: Reaction<T, E> = *reaction;
            reaction(outcome)
        }
    }
}

/// Result slot for a cancel request, filled synchronously by `dispatch`.
pub(crate) type CancelSignal = Rc<Cell<Option<Result<bool, Error>>>>;

pub(crate) enum Operation<T, E> {
    Then(Then<T, E>),
    Cancel(CancelSignal),
}

pub(crate) struct Pending<T, E> {
    queue: Vec<Then<T, E>>,
    canceler: Option<Box<dyn FnOnce()>>,
}

impl<T, E> Default for Pending<T, E> {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            canceler: None,
        }
    }
}

pub(crate) enum Handler<T, E> {
    Fulfilled(T),
    Rejected(Rejection<E>),
    Pending(Pending<T, E>),
    Thenable(Rc<dyn Thenable<T, E>>),
    Became(HandlerRef<T, E>),
}

enum Step<T, E> {
    Settled(Outcome<T, E>, Operation<T, E>),
    Cancel(CancelSignal, Option<Box<dyn FnOnce()>>),
    Assimilate(Rc<dyn Thenable<T, E>>, Operation<T, E>),
    Forward(HandlerRef<T, E>, Operation<T, E>),
}

pub(crate) struct HandlerRef<T, E>(Rc<RefCell<Handler<T, E>>>);

impl<T, E> Clone for HandlerRef<T, E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, E> Drop for HandlerRef<T, E> {
    // Unlinks `Became` chains one node at a time so that dropping the head of a
    // long chain does not recurse once per link. Queued reactions of a pending
    // handler are released through `drop_later`.
    fn drop(&mut self) {
        if Rc::strong_count(&self.0) != 1 {
            return;
        }
        let Ok(mut handler) = self.0.try_borrow_mut() else {
            return;
        };
        let mut current = std::mem::replace(&mut *handler, Handler::Pending(Pending::default()));
        drop(handler);
        while let Handler::Became(next) = current {
            if Rc::strong_count(&next.0) != 1 {
                break;
            }
            let Ok(mut handler) = next.0.try_borrow_mut() else {
                break;
            };
            current = std::mem::replace(&mut *handler, Handler::Pending(Pending::default()));
        }
    }
}

impl<T: Value, E: Reason> HandlerRef<T, E> {
    pub(crate) fn new(handler: Handler<T, E>) -> Self {
        Self(Rc::new(RefCell::new(handler)))
    }

    pub(crate) fn pending() -> Self {
        Self::new(Handler::Pending(Pending::default()))
    }

    pub(crate) fn fulfilled(value: T) -> Self {
        Self::new(Handler::Fulfilled(value))
    }

    pub(crate) fn rejected(rejection: Rejection<E>) -> Self {
        Self::new(Handler::Rejected(rejection))
    }

    pub(crate) fn thenable(thenable: Rc<dyn Thenable<T, E>>) -> Self {
        Self::new(Handler::Thenable(thenable))
    }

    pub(crate) fn upgrade(weak: &Weak<RefCell<Handler<T, E>>>) -> Option<Self> {
        weak.upgrade().map(Self)
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<Handler<T, E>>> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // Follows `Became` links without touching them.
    fn walk<R>(&self, f: impl FnOnce(&Handler<T, E>) -> R) -> R {
        let mut current = self.clone();
        loop {
            let next = match &*current.0.borrow() {
                Handler::Became(next) => next.clone(),
                handler => return f(handler),
            };
            current = next;
        }
    }

    /// The handler at the end of the forwarding chain. Re-points `self` straight
    /// at it so later lookups take a single hop.
    pub(crate) fn flatten(&self) -> HandlerRef<T, E> {
        let mut current = self.clone();
        loop {
            let next = match &*current.0.borrow() {
                Handler::Became(next) => next.clone(),
                _ => break,
            };
            current = next;
        }
        if !current.ptr_eq(self) {
            if let Handler::Became(link) = &mut *self.0.borrow_mut() {
                *link = current.clone();
            }
        }
        current
    }

    pub(crate) fn state(&self) -> State<T, E> {
        self.walk(|handler| match handler {
            Handler::Fulfilled(value) => State::Fulfilled(value.clone()),
            Handler::Rejected(rejection) => State::Rejected(rejection.reason.clone()),
            _ => State::Pending,
        })
    }

    pub(crate) fn rejection_id(&self) -> Option<RejectionId> {
        self.walk(|handler| match handler {
            Handler::Rejected(rejection) => rejection.id,
            _ => None,
        })
    }

    /// Installs the callback run by `cancel` while this handler is still pending.
    pub(crate) fn set_canceler(&self, canceler: Box<dyn FnOnce()>) -> bool {
        match &mut *self.flatten().0.borrow_mut() {
            Handler::Pending(pending) => {
                pending.canceler = Some(canceler);
                true
            }
            _ => false,
        }
    }

    /// Applies `operation` to the current state: settled handlers answer
    /// immediately, pending ones queue it, thenables are assimilated first.
    pub(crate) fn dispatch(&self, operation: Operation<T, E>, runtime: &Runtime) {
        let target = self.flatten();
        let step = {
            let mut handler = target.0.borrow_mut();
            match &mut *handler {
                Handler::Fulfilled(value) => {
                    Step::Settled(Outcome::Fulfilled(value.clone()), operation)
                }
                Handler::Rejected(rejection) => {
                    Step::Settled(Outcome::Rejected(rejection.clone()), operation)
                }
                Handler::Pending(pending) => match operation {
                    Operation::Then(then) => {
                        pending.queue.push(then);
                        trace!(queued = pending.queue.len(), "dispatch queued on pending handler");
                        return;
                    }
                    Operation::Cancel(signal) => Step::Cancel(signal, pending.canceler.take()),
                },
                Handler::Thenable(thenable) => Step::Assimilate(thenable.clone(), operation),
                Handler::Became(next) => Step::Forward(next.clone(), operation),
            }
        };
        match step {
            Step::Settled(outcome, Operation::Then(then)) => then.settle(outcome, runtime),
            Step::Settled(_, Operation::Cancel(signal)) => signal.set(Some(Ok(false))),
            Step::Cancel(signal, canceler) => {
                signal.set(Some(Ok(canceler.is_some())));
                if let Some(canceler) = canceler {
                    debug!("running canceler of pending deferred");
                    canceler();
                }
            }
            Step::Assimilate(_, Operation::Cancel(signal)) => {
                signal.set(Some(Err(Error::Unsupported("cancel"))));
            }
            Step::Assimilate(thenable, operation) => {
                target.assimilate(thenable, runtime).dispatch(operation, runtime)
            }
            Step::Forward(next, operation) => next.dispatch(operation, runtime),
        }
    }

    /// Replaces a foreign thenable with a pending handler fed by a single call to
    /// its `then`, made in a later turn.
    fn assimilate(&self, thenable: Rc<dyn Thenable<T, E>>, runtime: &Runtime) -> HandlerRef<T, E> {
        let pending = HandlerRef::pending();
        *self.0.borrow_mut() = Handler::Became(pending.clone());
        let resolver = Resolver::new(pending.clone(), runtime.clone(), Trace::default());
        let catch_panics = runtime.config().catch_panics;
        debug!("assimilating foreign thenable");
        runtime.schedule(move || {
            match catch_unwind(catch_panics, || thenable.then(resolver.clone())) {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => resolver.reject(reason),
                Err(panic) => resolver.reject(E::from(panic)),
            }
        });
        pending
    }

    /// One-way transition of a pending handler to `next`. Queued dispatches are
    /// replayed against `next`, each in its own turn, in registration order.
    pub(crate) fn become_handler(&self, next: HandlerRef<T, E>, runtime: &Runtime) {
        let mut next = next.flatten();
        if next.ptr_eq(self) {
            debug!("deferred resolved with its own promise");
            next = runtime.vicious_cycle();
        }
        let previous = std::mem::replace(&mut *self.0.borrow_mut(), Handler::Became(next.clone()));
        let queue = match previous {
            Handler::Pending(pending) => pending.queue,
            other => {
                *self.0.borrow_mut() = other;
                return;
            }
        };
        trace!(dispatches = queue.len(), "replaying queued dispatches");
        for then in queue {
            let next = next.clone();
            let rt = runtime.clone();
            runtime.schedule(move || next.dispatch(Operation::Then(then), &rt));
        }
    }
}
