//! The process-wide request budget shared by every bucket.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

/// Length of one global budget window.
const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct GlobalState {
    remaining: u32,
    reset_at: Option<Instant>,
}

/// Fixed window counter for the API's global requests-per-second budget.
///
/// Checking and decrementing the budget happens under one lock. Callers
/// that find it exhausted queue on an async gate so that only a single
/// waiter sleeps toward the reset at any time.
#[derive(Debug)]
pub(crate) struct GlobalThrottle {
    budget: u32,
    state: Mutex<GlobalState>,
    gate: tokio::sync::Mutex<()>,
}

impl GlobalThrottle {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            state: Mutex::new(GlobalState {
                remaining: budget,
                reset_at: None,
            }),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GlobalState> {
        // The state is plain data, a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one unit of budget, or report when the window resets.
    fn try_acquire(&self, now: Instant) -> Result<(), Instant> {
        let mut state = self.state();
        match state.reset_at {
            Some(reset_at) if reset_at > now => {}
            _ => {
                state.remaining = self.budget;
                state.reset_at = Some(now + WINDOW);
            }
        }

        if state.remaining > 0 {
            state.remaining -= 1;
            Ok(())
        } else {
            // `reset_at` was set above if it was missing
            Err(state.reset_at.unwrap_or(now))
        }
    }

    /// Wait until one unit of budget is available and take it.
    pub async fn acquire(&self) {
        if self.try_acquire(Instant::now()).is_ok() {
            return;
        }

        let _gate = self.gate.lock().await;
        loop {
            match self.try_acquire(Instant::now()) {
                Ok(()) => return,
                Err(reset_at) => sleep_until(reset_at).await,
            }
        }
    }

    /// Time until the budget is available again, if it is exhausted.
    pub fn limited_for(&self, now: Instant) -> Option<Duration> {
        let state = self.state();
        match state.reset_at {
            Some(reset_at) if state.remaining == 0 && reset_at > now => Some(reset_at - now),
            _ => None,
        }
    }

    /// Wait out an exhausted budget without taking from it.
    pub async fn wait(&self) {
        let _gate = self.gate.lock().await;
        if let Some(delay) = self.limited_for(Instant::now()) {
            tokio::time::sleep(delay).await;
        }
    }

    /// Block the budget for `duration` after the API reported a global
    /// rate limit.
    pub fn lock_for(&self, duration: Duration) {
        let mut state = self.state();
        state.remaining = 0;
        state.reset_at = Some(Instant::now() + duration);
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    #[cfg(test)]
    fn remaining(&self) -> u32 {
        self.state().remaining
    }
}
