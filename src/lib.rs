//! Deferred values with turn-based resolution.
//!
//! A [`Deferred`] pairs a [`Promise`] with the capability to settle it. Promises
//! chain with [`then`](Promise::then), [`catch`](Promise::catch) and friends;
//! every continuation runs in a later turn of the owning [`Runtime`], in the order
//! it was registered, and exactly once. Handlers may return plain `Result`s, other
//! promises, or foreign [`Thenable`]s, which are assimilated.
//!
//! ```
//! use deferred_promise::{Error, Promise, Runtime};
//!
//! let rt = Runtime::new();
//! let deferred = rt.defer::<u32, Error>();
//! let answer: Promise<String> = deferred
//!     .promise()
//!     .then(|n| Ok(n + 1))
//!     .then(|n| if n > 40 { Ok(format!("{n}")) } else { Err(Error::msg("too small")) });
//! deferred.fulfill(41);
//! assert_eq!(rt.block_on(&answer), Ok("42".to_string()));
//! ```
//!
//! The runtime is single-threaded. Drive it with [`Runtime::run`],
//! [`Runtime::block_on`] or one [`Runtime::turn`] at a time, or plug in a host
//! loop through the [`Scheduler`] trait.
use std::fmt::Debug;

mod combinators;
mod config;
mod deferred;
mod error;
mod future;
mod handler;
mod promise;
mod queue;
mod resolution;
mod runtime;
mod scheduler;
mod trace;
mod tracking;

pub use config::{ClockMode, Config, CLOCK_ENV, DEBUG_ENV};
pub use deferred::{Deferred, Resolver};
pub use error::{Error, Uncaught};
pub use future::Waiter;
pub use promise::{Promise, State};
pub use queue::AsyncQueue;
pub use resolution::{IntoResolution, Resolution, Thenable};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::{Scheduler, Task, TimerId, TurnQueue};
pub use trace::{Trace, STACK_JUMP_SEPARATOR};
pub use tracking::{RejectionId, RejectionObserver, RejectionTracker, UnhandledRejection};

/// Bound on fulfillment values.
pub trait Value: Clone + 'static {}

impl<T: Clone + 'static> Value for T {}

/// Bound on rejection reasons. `From<Error>` lets the engine reject with its own
/// failures.
pub trait Reason: Clone + Debug + From<Error> + 'static {}

impl<E: Clone + Debug + From<Error> + 'static> Reason for E {}
