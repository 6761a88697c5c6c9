//! Cooperative cancellation and per-step deadlines.
//!
//! Every blocking tool invocation receives a `Budget`. Long waits are sliced
//! so a cancelled token or an expired deadline is noticed within a few
//! hundred milliseconds, and the underlying process or request is aborted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::OpsError;

/// Cloneable cancellation flag. Cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `total`, waking early on cancellation.
    ///
    /// Returns false if the token was cancelled before or during the sleep.
    pub fn sleep(&self, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return false;
            }
            let slice = remaining.min(Duration::from_millis(200));
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !self.is_cancelled()
    }
}

/// Deadline plus cancellation for one tool invocation.
#[derive(Debug, Clone)]
pub struct Budget {
    timeout: Duration,
    deadline: Instant,
    cancel: CancelToken,
}

impl Budget {
    /// Start a budget of `timeout` from now, tied to `cancel`.
    pub fn new(timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// A budget that no external cancel can interrupt.
    pub fn detached(timeout: Duration) -> Self {
        Self::new(timeout, CancelToken::new())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// `Err(Cancelled)` or `Err(Timeout)` once the budget is spent.
    pub fn check(&self) -> Result<(), OpsError> {
        if self.is_cancelled() {
            return Err(OpsError::Cancelled);
        }
        if self.is_expired() {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    pub fn timeout_error(&self) -> OpsError {
        OpsError::Timeout {
            seconds: self.timeout.as_secs(),
        }
    }
}
