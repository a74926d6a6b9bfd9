//! Bridges between promises and `std::future`.
//!
//! [`Waiter`] lets async code await a promise; [`Runtime::spawn`] runs a future on
//! the runtime's turns and exposes its output as a promise.
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::{Future, IntoFuture},
    pin::Pin,
    rc::Rc,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
};

use futures::task::{waker, ArcWake};
use tracing::{debug, trace};

use crate::{resolution::catch_unwind, Error, Promise, Reason, Runtime, State, Value};

#[derive(Debug)]
enum WakerState {
    Fresh,
    Tainted,
}

struct Inner {
    waker: Result<Waker, WakerState>,
}

/// Future resolving to a promise's outcome.
///
/// Created by awaiting a [`Promise`]. The promise only makes progress while its
/// runtime runs turns, so the awaiting task is normally one started with
/// [`Runtime::spawn`]. Awaiting a rejection counts as handling it.
pub struct Waiter<T, E = Error> {
    promise: Promise<T, E>,
    inner: Rc<RefCell<Inner>>,
}

impl<T: Value, E: Reason> Future for Waiter<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.promise.inspect() {
            State::Fulfilled(value) => return Poll::Ready(Ok(value)),
            State::Rejected(reason) => {
                self.promise.mark_handled();
                return Poll::Ready(Err(reason));
            }
            State::Pending => {}
        }
        let previous = std::mem::replace(&mut self.inner.borrow_mut().waker, Ok(cx.waker().clone()));
        if let Err(WakerState::Fresh) = previous {
            let inner = self.inner.clone();
            self.promise.on_settled(move || {
                if let Ok(waker) = std::mem::replace(&mut inner.borrow_mut().waker, Err(WakerState::Tainted)) {
                    waker.wake()
                }
            });
        }
        Poll::Pending
    }
}

impl<T: Value, E: Reason> IntoFuture for Promise<T, E> {
    type Output = Result<T, E>;
    type IntoFuture = Waiter<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        Waiter {
            promise: self,
            inner: Rc::new(RefCell::new(Inner {
                waker: Err(WakerState::Fresh),
            })),
        }
    }
}

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

struct Spawned {
    future: LocalFuture,
    fail: Box<dyn FnOnce(Error)>,
}

// Wakers may be sent to other threads, so they only record the task id. The
// runtime schedules a poll for it after the current task, or on the next
// `Runtime::turn` for wakes from outside a turn.
struct TaskWaker {
    id: u64,
    woken: Arc<Mutex<Vec<u64>>>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self
            .woken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(arc_self.id);
    }
}

/// Futures spawned on a runtime that have not completed yet.
#[derive(Default)]
pub(crate) struct Tasks {
    next: Cell<u64>,
    pending: RefCell<HashMap<u64, Spawned>>,
    woken: Arc<Mutex<Vec<u64>>>,
}

impl Tasks {
    fn insert(&self, spawned: Spawned) -> u64 {
        let id = self.next.get();
        self.next.set(id + 1);
        self.pending.borrow_mut().insert(id, spawned);
        id
    }

    fn waker(&self, id: u64) -> Waker {
        waker(Arc::new(TaskWaker {
            id,
            woken: self.woken.clone(),
        }))
    }

    pub(crate) fn drain_woken(&self) -> Vec<u64> {
        std::mem::take(&mut *self.woken.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn clear(&self) -> usize {
        self.drain_woken();
        let dropped = std::mem::take(&mut *self.pending.borrow_mut());
        dropped.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.borrow().len()
    }
}

impl Runtime {
    /// Runs `future` on this runtime, one poll per turn, and returns a promise for
    /// its output. A panic while polling rejects the promise.
    ///
    /// ```
    /// use deferred_promise::{Error, Promise, Runtime};
    ///
    /// let rt = Runtime::new();
    /// let first: Promise<i32> = rt.fulfilled(20);
    /// let sum = rt.spawn(async move {
    ///     let a = first.await?;
    ///     Ok::<_, Error>(a + 1)
    /// });
    /// assert_eq!(rt.block_on(&sum), Ok(21));
    /// ```
    #[track_caller]
    pub fn spawn<T, E, F>(&self, future: F) -> Promise<T, E>
    where
        T: Value,
        E: Reason,
        F: Future<Output = Result<T, E>> + 'static,
    {
        let deferred = self.defer();
        let resolver = deferred.resolver();
        let on_panic = deferred.resolver();
        let id = self.tasks().insert(Spawned {
            future: Box::pin(async move { resolver.resolve(future.await) }),
            fail: Box::new(move |err: Error| on_panic.reject(E::from(err))),
        });
        debug!(task = id, "spawned future");
        self.schedule_poll(id);
        deferred.promise()
    }

    /// Drops every spawned future that has not completed and returns how many
    /// there were. Their promises stay pending.
    ///
    /// A spawned future owns the promises it awaits and every promise owns its
    /// runtime, so a task stuck on a promise that never settles keeps the runtime
    /// alive after all other handles are gone. Timers armed on the default
    /// [`TurnQueue`](crate::TurnQueue) hold their promises the same way until they
    /// fire or are canceled.
    pub fn abort_tasks(&self) -> usize {
        let aborted = self.tasks().clear();
        if aborted > 0 {
            debug!(tasks = aborted, "aborted spawned futures");
        }
        aborted
    }

    pub(crate) fn poll_task(&self, id: u64) {
        let Some(mut spawned) = self.tasks().pending.borrow_mut().remove(&id) else {
            return;
        };
        let waker = self.tasks().waker(id);
        let mut cx = Context::from_waker(&waker);
        let future = &mut spawned.future;
        match catch_unwind(self.config().catch_panics, || future.as_mut().poll(&mut cx)) {
            Ok(Poll::Pending) => {
                trace!(task = id, "task pending");
                self.tasks().pending.borrow_mut().insert(id, spawned);
            }
            Ok(Poll::Ready(())) => debug!(task = id, "task complete"),
            Err(err) => {
                debug!(task = id, %err, "task panicked");
                (spawned.fail)(err)
            }
        }
    }
}
