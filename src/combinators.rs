//! Promises that wait on several others.
use std::{
    cell::{Cell, RefCell},
    panic::Location,
    rc::Rc,
};

use tracing::debug;

use crate::{
    deferred::{Deferred, Resolver},
    handler::Outcome,
    IntoResolution, Promise, Reason, Runtime, Value,
};

fn fulfilled_or_reason<T, E>(outcome: Outcome<T, E>) -> Result<T, E> {
    match outcome {
        Outcome::Fulfilled(value) => Ok(value),
        Outcome::Rejected(rejection) => Err(rejection.reason),
    }
}

fn settled<T, E>(outcome: Outcome<T, E>) -> Result<Result<T, E>, E> {
    Ok(fulfilled_or_reason(outcome))
}

fn complete_pair<A: Value, B: Value, E: Reason>(
    pair: &RefCell<(Option<A>, Option<B>)>,
    resolver: &Resolver<(A, B), E>,
) {
    let ready = match &*pair.borrow() {
        (Some(a), Some(b)) => Some((a.clone(), b.clone())),
        _ => None,
    };
    if let Some(pair) = ready {
        resolver.fulfill(pair);
    }
}

impl Runtime {
    fn coerce_all<T, E, R>(
        &self,
        values: impl IntoIterator<Item = R>,
        location: &'static Location<'static>,
    ) -> Vec<Promise<T, E>>
    where
        T: Value,
        E: Reason,
        R: IntoResolution<T, E>,
    {
        values
            .into_iter()
            .map(|value| self.resolve_at(value, location))
            .collect()
    }

    // Fulfills with every mapped outcome, in input order, once all are in. The
    // first `Err` out of `map` rejects the result instead.
    fn gather<T, E, S>(
        &self,
        promises: Vec<Promise<T, E>>,
        location: &'static Location<'static>,
        map: fn(Outcome<T, E>) -> Result<S, E>,
    ) -> Promise<Vec<S>, E>
    where
        T: Value,
        E: Reason,
        S: Value,
    {
        let deferred = Deferred::new(self.clone(), self.trace(location, None));
        if promises.is_empty() {
            deferred.fulfill(Vec::new());
            return deferred.promise();
        }
        debug!(count = promises.len(), "gathering promises");
        let slots: Rc<RefCell<Vec<Option<S>>>> = Rc::new(RefCell::new(vec![None; promises.len()]));
        let remaining = Rc::new(Cell::new(promises.len()));
        for (index, promise) in promises.iter().enumerate() {
            let slots = slots.clone();
            let remaining = remaining.clone();
            let resolver = deferred.resolver();
            promise.observe::<()>(location, true, move |outcome, _| match map(outcome) {
                Ok(value) => {
                    slots.borrow_mut()[index] = Some(value);
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let values = slots.borrow_mut().drain(..).flatten().collect();
                        resolver.fulfill(values);
                    }
                }
                Err(reason) => resolver.reject(reason),
            });
        }
        deferred.promise()
    }

    /// Fulfills with every value, in input order, or rejects with the first
    /// rejection. An empty input fulfills with an empty `Vec`.
    #[track_caller]
    pub fn all<T, E, R>(&self, values: impl IntoIterator<Item = R>) -> Promise<Vec<T>, E>
    where
        T: Value,
        E: Reason,
        R: IntoResolution<T, E>,
    {
        let location = Location::caller();
        let promises = self.coerce_all(values, location);
        self.gather(promises, location, fulfilled_or_reason)
    }

    /// Settles like the first input to settle. An empty input never settles.
    #[track_caller]
    pub fn race<T, E, R>(&self, values: impl IntoIterator<Item = R>) -> Promise<T, E>
    where
        T: Value,
        E: Reason,
        R: IntoResolution<T, E>,
    {
        let location = Location::caller();
        let deferred = Deferred::new(self.clone(), self.trace(location, None));
        for promise in self.coerce_all(values, location) {
            let resolver = deferred.resolver();
            promise.observe::<()>(location, true, move |outcome, _| match outcome {
                Outcome::Fulfilled(value) => resolver.fulfill(value),
                Outcome::Rejected(rejection) => resolver.reject(rejection.reason),
            });
        }
        deferred.promise()
    }

    /// Waits for every input and fulfills with each outcome, in input order.
    /// Never rejects.
    #[track_caller]
    pub fn all_settled<T, E, R>(&self, values: impl IntoIterator<Item = R>) -> Promise<Vec<Result<T, E>>, E>
    where
        T: Value,
        E: Reason,
        R: IntoResolution<T, E>,
    {
        let location = Location::caller();
        let promises = self.coerce_all(values, location);
        self.gather(promises, location, settled)
    }

    /// [`all`](Self::all) followed by `then_or_else`: `on_fulfilled` receives the
    /// values in input order.
    #[track_caller]
    pub fn spread<T, U, E, R, F, G, S, X>(
        &self,
        values: impl IntoIterator<Item = R>,
        on_fulfilled: F,
        on_rejected: G,
    ) -> Promise<U, E>
    where
        T: Value,
        U: Value,
        E: Reason,
        R: IntoResolution<T, E>,
        F: FnOnce(Vec<T>) -> S + 'static,
        G: FnOnce(E) -> X + 'static,
        S: IntoResolution<U, E>,
        X: IntoResolution<U, E>,
    {
        self.all(values).then_or_else(on_fulfilled, on_rejected)
    }

    /// Pairs two promises of different types. Rejects as soon as either rejects.
    #[track_caller]
    pub fn join<A, B, E>(&self, a: impl IntoResolution<A, E>, b: impl IntoResolution<B, E>) -> Promise<(A, B), E>
    where
        A: Value,
        B: Value,
        E: Reason,
    {
        let location = Location::caller();
        let first = self.resolve_at(a, location);
        let second = self.resolve_at(b, location);
        let deferred = Deferred::new(self.clone(), self.trace(location, None));
        let pair = Rc::new(RefCell::new((None::<A>, None::<B>)));
        {
            let pair = pair.clone();
            let resolver = deferred.resolver();
            first.observe::<()>(location, true, move |outcome, _| match outcome {
                Outcome::Fulfilled(value) => {
                    pair.borrow_mut().0 = Some(value);
                    complete_pair(&pair, &resolver);
                }
                Outcome::Rejected(rejection) => resolver.reject(rejection.reason),
            });
        }
        let resolver = deferred.resolver();
        second.observe::<()>(location, true, move |outcome, _| match outcome {
            Outcome::Fulfilled(value) => {
                pair.borrow_mut().1 = Some(value);
                complete_pair(&pair, &resolver);
            }
            Outcome::Rejected(rejection) => resolver.reject(rejection.reason),
        });
        deferred.promise()
    }
}
