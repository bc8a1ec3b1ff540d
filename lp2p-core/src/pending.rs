//! Single-threaded promise/future pair for the core's suspension points.
//!
//! `start()`, transport `ready`/`closed` and listener `ready` hand out a
//! [`Pending`]; the core keeps the matching [`Deferred`] and settles it exactly
//! once. Settling wakes every task awaiting a clone of the `Pending`.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::Error;

struct Slot<T> {
    outcome: Option<Result<T, Error>>,
    wakers: Vec<Waker>,
}

/// Consumer side: await it, or check it without blocking via [`Pending::try_result`].
pub struct Pending<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

/// Producer side, held by the core.
pub(crate) struct Deferred<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

/// Create an unsettled pair.
pub(crate) fn pair<T>() -> (Deferred<T>, Pending<T>) {
    let slot = Rc::new(RefCell::new(Slot {
        outcome: None,
        wakers: Vec::new(),
    }));
    (
        Deferred { slot: slot.clone() },
        Pending { slot },
    )
}

impl<T> Deferred<T> {
    /// Settle with a value. Returns false if already settled (the first outcome wins).
    pub(crate) fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with a failure. Returns false if already settled.
    pub(crate) fn reject(&self, err: Error) -> bool {
        self.settle(Err(err))
    }

    fn settle(&self, outcome: Result<T, Error>) -> bool {
        let wakers = {
            let mut slot = self.slot.borrow_mut();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome);
            std::mem::take(&mut slot.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<T: Clone> Pending<T> {
    /// Outcome if settled, without waiting.
    pub fn try_result(&self) -> Option<Result<T, Error>> {
        self.slot.borrow().outcome.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().outcome.is_some()
    }
}

impl<T: Clone> Future for Pending<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        if let Some(outcome) = &slot.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            slot.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_outcome_wins() {
        let (deferred, pending) = pair::<u32>();
        assert!(pending.try_result().is_none());
        assert!(deferred.resolve(7));
        assert!(!deferred.reject(Error::Cancelled));
        assert_eq!(pending.try_result(), Some(Ok(7)));
    }

    #[test]
    fn clones_observe_same_rejection() {
        let (deferred, pending) = pair::<()>();
        let other = pending.clone();
        deferred.reject(Error::SessionClosed);
        assert_eq!(pending.try_result(), Some(Err(Error::SessionClosed)));
        assert_eq!(other.try_result(), Some(Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn awaiting_settled_future_returns_outcome() {
        let (deferred, pending) = pair::<String>();
        deferred.resolve("ready".into());
        assert_eq!(pending.await.unwrap(), "ready");
    }
}
