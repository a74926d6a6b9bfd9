use std::{cell::RefCell, panic::Location};

use tracing::{debug, trace};

use crate::{
    handler::{Outcome, Rejection},
    Deferred, Error, Promise, Reason, Resolver, Runtime, Value,
};

#[derive(Clone)]
struct Node<T, E> {
    value: T,
    next: Promise<Node<T, E>, E>,
}

struct Ends<T, E> {
    put: Resolver<Node<T, E>, E>,
    get: Promise<Node<T, E>, E>,
}

/// An unbounded FIFO queue whose reads are promises.
///
/// `get` may be called before the matching `put`; each get receives the value of
/// the put with the same index. After [`close`](Self::close) every outstanding
/// and future get rejects with the close reason.
///
/// # Examples
///
/// ```
/// use deferred_promise::{AsyncQueue, Error, Runtime};
///
/// let rt = Runtime::new();
/// let queue: AsyncQueue<&str> = AsyncQueue::new(&rt);
/// let first = queue.get();
/// queue.put("a");
/// queue.put("b");
/// assert_eq!(rt.block_on(&first), Ok("a"));
/// assert_eq!(rt.block_on(&queue.get()), Ok("b"));
/// queue.close(Error::msg("done"));
/// assert_eq!(rt.block_on(&queue.get()), Err(Error::msg("done")));
/// ```
pub struct AsyncQueue<T, E = Error> {
    runtime: Runtime,
    ends: RefCell<Ends<T, E>>,
    closed: Deferred<E, E>,
}

impl<T: Value, E: Reason> AsyncQueue<T, E> {
    #[track_caller]
    pub fn new(runtime: &Runtime) -> Self {
        let first = runtime.defer();
        Self {
            runtime: runtime.clone(),
            ends: RefCell::new(Ends {
                put: first.resolver(),
                get: first.promise(),
            }),
            closed: runtime.defer(),
        }
    }

    /// Appends a value. Ignored once the queue is closed.
    #[track_caller]
    pub fn put(&self, value: T) {
        let mut ends = self.ends.borrow_mut();
        if ends.put.is_resolved() {
            trace!("put on closed queue ignored");
            return;
        }
        let next = self.runtime.defer();
        ends.put.fulfill(Node {
            value,
            next: next.promise(),
        });
        ends.put = next.resolver();
    }

    /// A promise for the next value not yet claimed by another `get`.
    #[track_caller]
    pub fn get(&self) -> Promise<T, E> {
        let location = Location::caller();
        let mut ends = self.ends.borrow_mut();
        let node = ends.get.clone();
        ends.get = node.observe(location, false, |outcome, resolver| match outcome {
            Outcome::Fulfilled(node) => resolver.resolve(node.next),
            Outcome::Rejected(rejection) => resolver.adopt(rejection),
        });
        node.then(|node| Ok(node.value))
    }

    /// Closes the queue. Returns the same promise as [`closed`](Self::closed),
    /// fulfilled with `reason`.
    pub fn close(&self, reason: E) -> Promise<E, E> {
        let ends = self.ends.borrow();
        if !ends.put.is_resolved() {
            debug!(?reason, "closing queue");
            ends.put.adopt(Rejection {
                reason: reason.clone(),
                id: None,
            });
            self.closed.fulfill(reason);
        }
        self.closed.promise()
    }

    /// Fulfilled with the close reason once the queue is closed.
    pub fn closed(&self) -> Promise<E, E> {
        self.closed.promise()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gets_before_puts() {
        let rt = Runtime::new();
        let queue: AsyncQueue<i32> = AsyncQueue::new(&rt);
        let gets: Vec<_> = (0..3).map(|_| queue.get()).collect();
        rt.run().unwrap();
        assert!(gets.iter().all(Promise::is_pending));
        for n in 1..=3 {
            queue.put(n);
        }
        assert_eq!(rt.block_on(&rt.all(gets)), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_close_rejects_pending_and_future_gets() {
        let rt = Runtime::new();
        let queue: AsyncQueue<i32> = AsyncQueue::new(&rt);
        queue.put(1);
        let first = queue.get();
        let pending = queue.get();
        let closed = queue.close(Error::msg("closed"));
        queue.put(2);
        assert_eq!(rt.block_on(&first), Ok(1));
        assert_eq!(rt.block_on(&pending), Err(Error::msg("closed")));
        assert_eq!(rt.block_on(&queue.get()), Err(Error::msg("closed")));
        assert_eq!(rt.block_on(&closed), Ok(Error::msg("closed")));
        assert!(queue.close(Error::msg("again")).ptr_eq(&queue.closed()));
        assert_eq!(rt.tracker().map(|tracker| tracker.len()), Some(0));
    }
}
