//! Zero-capacity hand-off between raters and idle workers
//!
//! A dispatch succeeds only if some worker is parked waiting for work at that
//! moment. Idle workers publish a one-shot slot on a lock-free queue; senders
//! pop slots until one accepts the request or the queue runs dry.

use crossbeam::queue::SegQueue;
use tokio::sync::{Notify, oneshot};

use crate::types::RequestId;

/// Receiving side held by a parked worker
pub(crate) type Slot = oneshot::Receiver<RequestId>;

#[derive(Debug, Default)]
pub struct WorkQueue {
    idle: SegQueue<oneshot::Sender<RequestId>>,
    parked: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the caller as an idle receiver and return its slot
    pub(crate) fn park(&self) -> Slot {
        let (tx, rx) = oneshot::channel();
        self.idle.push(tx);
        self.parked.notify_one();
        rx
    }

    /// Hand `id` to a parked worker without waiting.
    ///
    /// Returns the id back if no worker is idle right now. Slots left behind by
    /// workers that stopped are discarded along the way.
    pub fn try_send(&self, id: RequestId) -> Result<(), RequestId> {
        let mut id = id;
        while let Some(slot) = self.idle.pop() {
            match slot.send(id) {
                Ok(()) => return Ok(()),
                Err(returned) => id = returned,
            }
        }
        Err(id)
    }

    /// Hand `id` to the next worker that parks, waiting as long as needed
    pub async fn send(&self, id: RequestId) {
        let mut id = id;
        loop {
            let parked = self.parked.notified();
            match self.try_send(id) {
                Ok(()) => return,
                Err(returned) => id = returned,
            }
            parked.await;
        }
    }

    /// Number of published slots, including stale ones
    #[cfg(test)]
    pub(crate) fn idle_hint(&self) -> usize {
        self.idle.len()
    }
}
