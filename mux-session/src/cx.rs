//! Per-call wait context: an optional deadline and an optional cancel token.
//!
//! Every blocking operation in this crate takes a `&Cx`. A call gives up with
//! [`Error::Timeout`] once the deadline passes and with [`Error::Cancelled`]
//! once the token fires; neither outcome touches protocol state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};

type Waker = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Shared cancellation flag. Cloning yields a handle to the same token.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    next_key: AtomicU64,
    wakers: Mutex<Vec<(u64, Waker)>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token and wake every call currently blocked on it.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let wakers = std::mem::take(&mut *self.inner.wakers.lock());
        for (_, wake) in wakers {
            wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, wake: Waker) -> Registration {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        self.inner.wakers.lock().push((key, wake));
        Registration {
            token: self.clone(),
            key,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Removes a waker from its token when the blocked call returns.
pub(crate) struct Registration {
    token: CancelToken,
    key: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.token
            .inner
            .wakers
            .lock()
            .retain(|(key, _)| *key != self.key);
    }
}

// ---------------------------------------------------------------------------
// Cx
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Cx {
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl Cx {
    /// No deadline, no cancellation: the call waits as long as the session
    /// lives (or the operation's own default timeout, where it has one).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(after: Duration) -> Self {
        Self::until(Instant::now() + after)
    }

    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// This context, with `fallback` applied when no deadline was given.
    pub(crate) fn or_deadline(&self, fallback: Option<Instant>) -> Cx {
        Cx {
            deadline: self.deadline.or(fallback),
            cancel: self.cancel.clone(),
        }
    }

    /// This context, with a timeout of `fallback` from now applied when no
    /// deadline was given.
    pub(crate) fn or_timeout(&self, fallback: Duration) -> Cx {
        self.or_deadline(Some(Instant::now() + fallback))
    }

    /// Fail fast if the call is already cancelled or past its deadline.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Arrange for `wake` to run if the token fires while the caller is
    /// blocked. `wake` must take the mutex the caller waits under before
    /// notifying, so the wakeup cannot slip between check and wait.
    pub(crate) fn watch(&self, wake: impl Fn() + Send + Sync + 'static) -> Option<Registration> {
        self.cancel
            .as_ref()
            .map(|token| token.register(Arc::new(wake)))
    }

    /// Block on `cond` until notified, then re-check deadline and token.
    pub(crate) fn wait<T>(&self, cond: &Condvar, guard: &mut MutexGuard<'_, T>) -> Result<()> {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                cond.wait_until(guard, deadline);
            }
            None => cond.wait(guard),
        }
        self.check()
    }
}
