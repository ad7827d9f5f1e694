//! Cancellable fixed-interval timer driving presence heartbeats.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::error::{Error, Result};

/// Holds at most one running heartbeat task.
pub(crate) struct Heartbeat {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub(crate) fn new() -> Self {
        Self {
            task: Mutex::new(None),
        }
    }

    /// Run `beat` every `period`, first one period from now. A running timer
    /// is aborted before the new one is spawned.
    pub(crate) fn start<F>(&self, period: Duration, mut beat: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| Error::NoRuntime(e.to_string()))?;
        let period = period.max(Duration::from_millis(1));

        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        *slot = Some(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                beat();
            }
        }));
        Ok(())
    }

    /// Abort the running timer. Returns whether one was running.
    pub(crate) fn stop(&self) -> bool {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
