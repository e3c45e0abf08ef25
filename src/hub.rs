//! Registry of connected live clients.
//!
//! Each client owns a bounded queue. [`ClientHub::broadcast`] walks the
//! registry and uses `try_send`, so a slow or vanished browser can only lose
//! its own messages; it never stalls the sensor feed or the other clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::domain::ClientMessage;

pub type ClientId = u64;

/// Outcome of one broadcast, mostly for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// queue was full; message skipped for that client only
    pub dropped: usize,
}

#[derive(Debug)]
pub struct ClientHub {
    next_id: AtomicU64,
    queue: usize,
    clients: Mutex<HashMap<ClientId, mpsc::Sender<ClientMessage>>>,
}

impl ClientHub {
    pub fn new(queue: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            queue: queue.max(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, mpsc::Sender<ClientMessage>>> {
        // the map stays consistent even if a holder panicked
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a client whose queue starts with `initial`.
    ///
    /// The returned handle unregisters itself when dropped.
    pub fn register(self: &Arc<Self>, initial: ClientMessage) -> ClientHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue);
        // fresh channel with capacity >= 1, cannot be full or closed
        let _ = tx.try_send(initial);

        let mut clients = self.clients();
        clients.insert(id, tx);
        debug!(client = id, connected = clients.len(), "client registered");

        ClientHandle { id, rx, hub: Arc::clone(self) }
    }

    pub fn unregister(&self, id: ClientId) {
        let mut clients = self.clients();
        if clients.remove(&id).is_some() {
            debug!(client = id, connected = clients.len(), "client unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn broadcast(&self, message: &ClientMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut clients = self.clients();

        clients.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(client = *id, kind = message.kind(), "client queue full, message dropped");
                report.dropped += 1;
                true
            }
            // handles unregister before their receiver closes
            Err(TrySendError::Closed(_)) => false,
        });

        report
    }
}

/// A registered client's end of the live channel.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    rx: mpsc::Receiver<ClientMessage>,
    hub: Arc<ClientHub>,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}
