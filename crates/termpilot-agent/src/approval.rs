//! Human-in-the-loop confirmation hand-off.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Called with the description of every new confirmation request
pub type ApprovalNotifier = Arc<dyn Fn(&str) + Send + Sync>;

/// Single-slot rendezvous between a tool awaiting confirmation and the
/// terminal that answers it.
///
/// A new request declines whatever request was still pending, so at most one
/// confirmation is outstanding per session.
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<Option<Pending>>,
    next_id: AtomicU64,
    notifier: Mutex<Option<ApprovalNotifier>>,
}

struct Pending {
    id: u64,
    tx: oneshot::Sender<bool>,
}

/// Empties the slot when a request goes away unanswered, unless a newer
/// request already owns it.
struct ClearOnDrop<'a> {
    gate: &'a ApprovalGate,
    id: u64,
}

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        let mut pending = self.gate.pending.lock();
        if pending.as_ref().is_some_and(|p| p.id == self.id) {
            *pending = None;
        }
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_notifier(&self, notifier: ApprovalNotifier) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Ask for confirmation and wait for the answer. A dropped answer counts
    /// as declined. Dropping the returned future withdraws the request.
    pub async fn request(&self, description: &str) -> bool {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.pending.lock().replace(Pending { id, tx }) {
            tracing::debug!("superseding pending confirmation");
            let _ = previous.tx.send(false);
        }
        let _withdraw = ClearOnDrop { gate: self, id };

        let notifier = self.notifier.lock().clone();
        if let Some(notify) = notifier {
            notify(description);
        }

        rx.await.unwrap_or(false)
    }

    /// Answer the pending request. Returns false when nothing was waiting.
    pub fn resolve(&self, approved: bool) -> bool {
        match self.pending.lock().take() {
            Some(pending) => pending.tx.send(approved).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}
