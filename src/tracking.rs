//! Unhandled-rejection bookkeeping.
//!
//! A rejection counts as handled once a `then` carrying a rejection handler has
//! been dispatched against it. Rejections that are merely passed down a chain keep
//! their original id, so catching anywhere downstream clears the entry.
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
};

use tracing::{debug, trace, warn};

use crate::Trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RejectionId(pub(crate) u64);

/// Receives rejection lifecycle events from a [`Runtime`](crate::Runtime).
pub trait RejectionObserver {
    fn rejected(&self, id: RejectionId, reason: &dyn fmt::Debug, trace: &Trace);
    fn handled(&self, id: RejectionId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhandledRejection {
    pub id: RejectionId,
    pub reason: String,
    pub trace: String,
}

#[derive(Default)]
struct TrackerState {
    unhandled: BTreeMap<RejectionId, UnhandledRejection>,
    stopped: bool,
}

/// The default observer: remembers every rejection nobody has handled yet.
///
/// # Examples
///
/// ```
/// use deferred_promise::{Error, Promise, RejectionTracker, Runtime};
/// use std::rc::Rc;
///
/// let tracker = Rc::new(RejectionTracker::new());
/// let rt = Runtime::builder().observer(tracker.clone()).build();
/// let rejected: Promise<i32> = rt.reject(Error::msg("lost"));
/// assert_eq!(tracker.len(), 1);
/// let _caught = rejected.catch(|_| Ok(0));
/// rt.run().unwrap();
/// assert!(tracker.is_empty());
/// ```
#[derive(Default)]
pub struct RejectionTracker {
    state: RefCell<TrackerState>,
}

impl RejectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejections still waiting for a handler, oldest first.
    pub fn unhandled(&self) -> Vec<UnhandledRejection> {
        self.state.borrow().unhandled.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().unhandled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().unhandled.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.borrow().stopped
    }

    /// Logs every outstanding rejection and returns how many there were.
    pub fn report(&self) -> usize {
        let state = self.state.borrow();
        for rejection in state.unhandled.values() {
            if rejection.trace.is_empty() {
                warn!(id = rejection.id.0, reason = %rejection.reason, "unhandled rejection");
            } else {
                warn!(
                    id = rejection.id.0,
                    reason = %rejection.reason,
                    trace = %rejection.trace,
                    "unhandled rejection"
                );
            }
        }
        state.unhandled.len()
    }

    /// Forgets everything tracked so far and resumes tracking.
    pub fn reset(&self) {
        let mut state = self.state.borrow_mut();
        state.unhandled.clear();
        state.stopped = false;
    }

    /// Forgets everything tracked so far and ignores future events.
    pub fn stop(&self) {
        let mut state = self.state.borrow_mut();
        state.unhandled.clear();
        state.stopped = true;
    }
}

impl RejectionObserver for RejectionTracker {
    fn rejected(&self, id: RejectionId, reason: &dyn fmt::Debug, trace: &Trace) {
        let mut state = self.state.borrow_mut();
        if state.stopped {
            return;
        }
        debug!(id = id.0, ?reason, "tracking rejection");
        state.unhandled.insert(
            id,
            UnhandledRejection {
                id,
                reason: format!("{reason:?}"),
                trace: trace.to_string(),
            },
        );
    }

    fn handled(&self, id: RejectionId) {
        if self.state.borrow_mut().unhandled.remove(&id).is_some() {
            trace!(id = id.0, "rejection handled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_handle() {
        let tracker = RejectionTracker::new();
        tracker.rejected(RejectionId(1), &"a", &Trace::default());
        tracker.rejected(RejectionId(2), &"b", &Trace::default());
        assert_eq!(tracker.len(), 2);
        tracker.handled(RejectionId(1));
        tracker.handled(RejectionId(1));
        let left = tracker.unhandled();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, RejectionId(2));
        assert_eq!(left[0].reason, "\"b\"");
        assert_eq!(tracker.report(), 1);
    }

    #[test]
    fn test_reset_and_stop() {
        let tracker = RejectionTracker::new();
        tracker.rejected(RejectionId(1), &1, &Trace::default());
        tracker.stop();
        assert!(tracker.is_empty());
        assert!(tracker.is_stopped());
        tracker.rejected(RejectionId(2), &2, &Trace::default());
        assert!(tracker.is_empty());
        tracker.reset();
        assert!(!tracker.is_stopped());
        tracker.rejected(RejectionId(3), &3, &Trace::default());
        assert_eq!(tracker.len(), 1);
    }
}
