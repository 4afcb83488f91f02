//! Periodic eviction timers.

use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// A running sweep timer. Dropping it stops the timer.
#[derive(Debug)]
pub(crate) struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Run `sweep` against `target` every `interval` until either the
    /// sweeper or the target is dropped.
    ///
    /// Returns `None` when `interval` is zero, which disables the sweeper.
    pub fn spawn<T, F>(interval: Duration, target: Weak<T>, sweep: F) -> Option<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        if interval.is_zero() {
            return None;
        }

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(target) = target.upgrade() else {
                    break;
                };
                sweep(&target);
            }
        });

        Some(Self { handle })
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// State of one sweeper slot owned by the manager.
#[derive(Debug, Default)]
pub(crate) enum SweeperSlot {
    /// Not started yet, waiting for a runtime.
    #[default]
    Idle,
    Running(Option<Sweeper>),
    /// Stopped on request, never restarted.
    Cleared,
}

impl SweeperSlot {
    pub fn start_with(&mut self, spawn: impl FnOnce() -> Option<Sweeper>) {
        if matches!(self, Self::Idle) {
            *self = Self::Running(spawn());
        }
    }

    pub fn clear(&mut self) {
        *self = Self::Cleared;
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(Some(_)))
    }
}
