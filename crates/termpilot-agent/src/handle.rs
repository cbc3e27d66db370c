//! A cloneable handle for poking the agent from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for poking the agent from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone, Default)]
pub struct AgentHandle {
    pub(crate) cancel: Arc<Mutex<Option<CancellationToken>>>,
    pub(crate) idle_notify: Arc<tokio::sync::Notify>,
    pub(crate) is_running: Arc<AtomicBool>,
}

impl AgentHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot. Returns false when a run is already active.
    pub(crate) fn begin(&self, cancel: CancellationToken) -> bool {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.cancel.lock() = Some(cancel);
        true
    }

    pub(crate) fn finish(&self) {
        self.cancel.lock().take();
        self.is_running.store(false, Ordering::Release);
        self.idle_notify.notify_waiters();
    }

    /// Abort the current run, if any.
    pub fn abort(&self) {
        if let Some(cancel) = self.cancel.lock().as_ref() {
            cancel.cancel();
        }
    }

    /// Wait until the agent loop becomes idle (finishes running).
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Whether the agent loop is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}

/// Releases the run slot when dropped, so a panicking run cannot wedge it.
pub(crate) struct RunGuard<'a>(pub(crate) &'a AgentHandle);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}
