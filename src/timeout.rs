//! Wall-clock budgets for move requests.
//!
//! Agent code runs in another process, so nothing here interrupts the calling thread. A
//! [`Deadline`] is created per request and handed down to the call that waits on the
//! sandboxed process; that call kills the process when the deadline passes. A `Deadline` is
//! a plain value: once the request returns, no timer is left armed.
//!
//! [`run_with_timeout`] covers in-process bodies: the caller gets its answer (or a timeout)
//! on time, but the body cannot be stopped and is left to finish on its own thread.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::MatchError;

/// A budget started at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// A deadline `budget` from now. `Duration::MAX` means no limit.
    pub fn after(budget: Duration) -> Deadline {
        Deadline {
            start: Instant::now(),
            budget,
        }
    }

    /// The total budget.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time spent since the deadline was armed.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// True once the budget is spent.
    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// Poll interval for waiting loops: 10ms, or a tenth of the budget if smaller.
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(10).min(self.budget / 10).max(Duration::from_micros(100))
    }

    /// The timeout failure for this deadline.
    pub fn exceeded(&self) -> MatchError {
        MatchError::MoveTimeoutExceeded {
            budget: self.budget,
        }
    }
}

/// Run `body` and wait at most `budget` for its result.
///
/// # Errors
/// `MoveTimeoutExceeded` when the budget elapses first, `AgentRuntime` if `body` panicked.
pub fn run_with_timeout<T, F>(budget: Duration, body: F) -> Result<T, MatchError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("timeout-guard".to_string())
        .spawn(move || {
            // the receiver is gone if the caller already timed out
            let _ = tx.send(body());
        })
        .map_err(|e| MatchError::AgentRuntime {
            error: format!("could not spawn guarded thread: {e}"),
            traceback: String::new(),
        })?;

    match rx.recv_timeout(budget) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => {
            warn!("guarded call still running after {budget:?}, abandoning it");
            Err(MatchError::MoveTimeoutExceeded { budget })
        }
        Err(RecvTimeoutError::Disconnected) => Err(MatchError::AgentRuntime {
            error: "guarded call panicked".to_string(),
            traceback: String::new(),
        }),
    }
}
