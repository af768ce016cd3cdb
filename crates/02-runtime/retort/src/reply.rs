//! Reply protocol for blocking emissions.
//!
//! Every blocking emission shares a [`ReplySlot`] between the parked caller
//! and the reaction instance that eventually consumes the value. The slot
//! walks `Pending -> Matched -> Replied | Failed`; a caller that gives up
//! moves it to `Abandoned`, after which a late reply reports
//! [`ReplyOutcome::CallerGone`] instead of being delivered.

use std::any::Any;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::metrics::SiteMetrics;
use crate::trace::TraceHook;

/// Outcome of delivering a reply (or failure) to a blocking caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The caller was still waiting and received the result.
    Delivered,
    /// The caller had already timed out; the result was discarded.
    CallerGone,
}

enum ReplyState<R> {
    /// Value is in the bag, caller parked.
    Pending,
    /// A reaction instance consuming the value has been scheduled.
    Matched,
    /// Reply value waiting for the caller to collect it.
    Replied(R),
    /// The consuming reaction failed before replying.
    Failed(String),
    /// The caller collected a result or withdrew after its deadline.
    Abandoned,
}

pub(crate) enum WaitVerdict<R> {
    Replied(R),
    Failed(String),
    DeadlineExpired,
}

pub(crate) enum AbandonVerdict<R> {
    Replied(R),
    Failed(String),
    Abandoned,
}

pub(crate) struct ReplySlot<R> {
    state: Mutex<ReplyState<R>>,
    cv: Condvar,
}

impl<R: Send + 'static> ReplySlot<R> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ReplyState::Pending),
            cv: Condvar::new(),
        }
    }

    /// Parks the caller until the slot becomes terminal or the deadline
    /// passes. Expiry is only reported while the slot is still
    /// `Pending`/`Matched`; a reply racing the wakeup wins.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> WaitVerdict<R> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            match mem::replace(&mut *state, ReplyState::Abandoned) {
                ReplyState::Replied(value) => return WaitVerdict::Replied(value),
                ReplyState::Failed(reason) => return WaitVerdict::Failed(reason),
                other => *state = other,
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut state, deadline).timed_out() {
                        match mem::replace(&mut *state, ReplyState::Abandoned) {
                            ReplyState::Replied(value) => return WaitVerdict::Replied(value),
                            ReplyState::Failed(reason) => return WaitVerdict::Failed(reason),
                            other => *state = other,
                        }
                        return WaitVerdict::DeadlineExpired;
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }
    }

    /// Finalizes a timed-out call after its value has been withdrawn from
    /// the bag. Reports a reply or failure that landed in the race window.
    pub(crate) fn abandon(&self) -> AbandonVerdict<R> {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, ReplyState::Abandoned) {
            ReplyState::Replied(value) => AbandonVerdict::Replied(value),
            ReplyState::Failed(reason) => AbandonVerdict::Failed(reason),
            ReplyState::Pending | ReplyState::Matched | ReplyState::Abandoned => {
                AbandonVerdict::Abandoned
            }
        }
    }

    fn deliver(&self, value: R) -> ReplyOutcome {
        let mut state = self.state.lock();
        match *state {
            ReplyState::Pending | ReplyState::Matched => {
                *state = ReplyState::Replied(value);
                self.cv.notify_one();
                ReplyOutcome::Delivered
            }
            _ => ReplyOutcome::CallerGone,
        }
    }
}

/// Type-erased view of a reply slot held in the bag and in consumed slots.
pub(crate) trait ReplyHandle: Send + Sync {
    /// Records that a reaction consuming this value has been scheduled.
    fn mark_matched(&self);

    /// Unblocks the caller with a failure unless a reply already landed.
    fn fail(&self, reason: String) -> ReplyOutcome;

    /// Upcast used to recover the typed slot inside a reaction scope.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<R: Send + 'static> ReplyHandle for ReplySlot<R> {
    fn mark_matched(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ReplyState::Pending) {
            *state = ReplyState::Matched;
        }
    }

    fn fail(&self, reason: String) -> ReplyOutcome {
        let mut state = self.state.lock();
        match *state {
            ReplyState::Pending | ReplyState::Matched => {
                *state = ReplyState::Failed(reason);
                self.cv.notify_one();
                ReplyOutcome::Delivered
            }
            _ => ReplyOutcome::CallerGone,
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// One-shot token for answering a blocking emission.
///
/// Obtained from [`take_blocking`](crate::ReactionScope::take_blocking) and
/// consumed by [`send`](Self::send). Dropping the token
/// without sending — early return, `?`, panic — unblocks the caller with a
/// failure, so a blocking caller can never be left hanging by a body that
/// forgot to reply.
pub struct Reply<R: Send + 'static> {
    slot: Option<Arc<ReplySlot<R>>>,
    site: Arc<str>,
    molecule: Arc<str>,
    hook: Arc<dyn TraceHook>,
    metrics: Arc<SiteMetrics>,
}

impl<R: Send + 'static> Reply<R> {
    pub(crate) fn new(
        slot: Arc<ReplySlot<R>>,
        site: Arc<str>,
        molecule: Arc<str>,
        hook: Arc<dyn TraceHook>,
        metrics: Arc<SiteMetrics>,
    ) -> Self {
        Self {
            slot: Some(slot),
            site,
            molecule,
            hook,
            metrics,
        }
    }

    /// Name of the blocking molecule this token answers.
    pub fn molecule(&self) -> &str {
        &self.molecule
    }

    /// Delivers the reply, unparking the caller.
    pub fn send(mut self, value: R) -> ReplyOutcome {
        let outcome = match self.slot.take() {
            Some(slot) => slot.deliver(value),
            None => ReplyOutcome::CallerGone,
        };
        if outcome == ReplyOutcome::Delivered {
            self.metrics.record_reply();
        }
        self.hook.on_reply(&self.site, &self.molecule, outcome);
        outcome
    }
}

impl<R: Send + 'static> Drop for Reply<R> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let outcome = slot.fail(format!(
                "reply token for `{}` dropped without replying",
                self.molecule
            ));
            self.hook.on_reply(&self.site, &self.molecule, outcome);
        }
    }
}
