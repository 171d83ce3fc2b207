use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, ThreadId},
    time::Duration,
};

use quanta::Instant;
use tracing::trace;

use crate::{escalation::Escalation, Value};

/// Something waiting for a completion to settle.
pub(crate) trait Waiter: Send + Sync {
    /// Called exactly once, on whichever thread settled the completion.
    fn wake(&self);
}

enum State {
    Pending(Vec<Arc<dyn Waiter>>),
    Ready(Value),
    Failed(Escalation),
}

/// Where a completion stands, as seen by a resolver.
pub(crate) enum Resolution {
    Ready(Value),
    Pending(Arc<Completion>),
    Failed(Escalation),
}

/// An outcome handed to a completion that had already settled.
pub(crate) struct Rejected(pub(crate) Result<Value, Escalation>);

/// The settlement cell behind a resource handle.
///
/// A completion starts out either pending or already ready. It settles at most once, through
/// [`transition`][Self::transition], and every waiter registered before that point is woken after the state has changed.
///
/// The thread that created a completion owns its value: thread-keyed resource pools take the value back under that
/// thread, wherever the value is eventually released.
pub(crate) struct Completion {
    resource: Arc<str>,
    owner: ThreadId,
    deadline: Option<Instant>,
    timeout: Duration,
    state: Mutex<State>,
}

impl Completion {
    pub(crate) fn pending(resource: &Arc<str>, now: Instant, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            resource: Arc::clone(resource),
            owner: thread::current().id(),
            deadline: now.checked_add(timeout),
            timeout,
            state: Mutex::new(State::Pending(Vec::new())),
        })
    }

    pub(crate) fn ready(resource: &Arc<str>, value: Value) -> Arc<Self> {
        Arc::new(Self {
            resource: Arc::clone(resource),
            owner: thread::current().id(),
            deadline: None,
            timeout: Duration::ZERO,
            state: Mutex::new(State::Ready(value)),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn resource(&self) -> &Arc<str> {
        &self.resource
    }

    /// Returns the thread the completion was created on.
    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Settles the completion.
    ///
    /// If the completion had already settled, nothing changes and the outcome is handed back, so that a late value can
    /// still be discarded.
    pub(crate) fn transition(&self, outcome: Result<Value, Escalation>) -> Result<(), Rejected> {
        let waiters = {
            let mut state = self.state();
            let waiters = match &mut *state {
                State::Pending(waiters) => std::mem::take(waiters),
                _ => return Err(Rejected(outcome)),
            };
            *state = match outcome {
                Ok(value) => State::Ready(value),
                Err(escalation) => State::Failed(escalation),
            };
            waiters
        };

        trace!(resource = %self.resource, waiters = waiters.len(), "Completion settled.");
        for waiter in waiters {
            waiter.wake();
        }
        Ok(())
    }

    /// Fails the completion with a timeout if it is still pending and its deadline has been reached.
    ///
    /// Returns `true` if this call settled the completion.
    pub(crate) fn expire(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => self
                .transition(Err(Escalation::Timeout {
                    subject: Arc::clone(&self.resource),
                    after: self.timeout,
                }))
                .is_ok(),
            _ => false,
        }
    }

    /// Registers a waiter to be woken when the completion settles.
    ///
    /// Returns `false`, without registering the waiter, if the completion has already settled.
    pub(crate) fn add_waiter(&self, waiter: Arc<dyn Waiter>) -> bool {
        match &mut *self.state() {
            State::Pending(waiters) => {
                waiters.push(waiter);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        !matches!(&*self.state(), State::Pending(_))
    }

    pub(crate) fn resolve(self: &Arc<Self>) -> Resolution {
        match &*self.state() {
            State::Pending(_) => Resolution::Pending(Arc::clone(self)),
            State::Ready(value) => Resolution::Ready(Arc::clone(value)),
            State::Failed(escalation) => Resolution::Failed(escalation.clone()),
        }
    }

    /// Returns the value, if the completion settled successfully.
    pub(crate) fn value(&self) -> Option<Value> {
        match &*self.state() {
            State::Ready(value) => Some(Arc::clone(value)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    use quanta::Clock;

    use super::*;

    struct CountingWaiter(AtomicUsize);

    impl Waiter for CountingWaiter {
        fn wake(&self) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    fn name() -> Arc<str> {
        Arc::from("db")
    }

    #[test]
    fn first_transition_wins() {
        let (clock, _mock) = Clock::mock();
        let completion = Completion::pending(&name(), clock.now(), Duration::from_secs(1));
        let waiter = Arc::new(CountingWaiter(AtomicUsize::new(0)));
        assert!(completion.add_waiter(waiter.clone()));

        assert!(completion.transition(Ok(Arc::new(7u32))).is_ok());
        match completion.transition(Ok(Arc::new(8u32))) {
            Err(Rejected(Ok(late))) => assert_eq!(late.downcast_ref::<u32>(), Some(&8)),
            _ => panic!("expected the late value to be handed back"),
        }
        assert!(!completion.add_waiter(waiter.clone()));
        assert_eq!(waiter.0.load(SeqCst), 1);

        let value = completion.value().unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&7));
    }

    #[test]
    fn expiry_is_never_early() {
        let (clock, mock) = Clock::mock();
        let completion = Completion::pending(&name(), clock.now(), Duration::from_millis(50));

        mock.increment(Duration::from_millis(49));
        assert!(!completion.expire(clock.now()));
        assert!(!completion.is_settled());

        mock.increment(Duration::from_millis(1));
        assert!(completion.expire(clock.now()));
        match completion.resolve() {
            Resolution::Failed(Escalation::Timeout { subject, after }) => {
                assert_eq!(&*subject, "db");
                assert_eq!(after, Duration::from_millis(50));
            }
            _ => panic!("expected a timeout"),
        }
    }

    #[test]
    fn ready_completions_never_expire() {
        let (clock, mock) = Clock::mock();
        let completion = Completion::ready(&name(), Arc::new(()));
        mock.increment(Duration::from_secs(3600));
        assert!(!completion.expire(clock.now()));
        assert!(completion.deadline().is_none());
    }
}
