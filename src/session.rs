use std::sync::Arc;

use dashmap::DashMap;
use log::info;

use crate::{AudioSink, Queue, SinkEventSender, StreamSource};

/// Identifies one voice session (one guild or room connection).
pub type SessionId = u64;

/// Holds the queue of every active voice session.
///
/// Sessions are fully independent: queues share no state, so nothing here
/// needs cross-session locking. Queues are created when the bot joins a
/// voice session and destroyed when it leaves.
pub struct SessionManager {
    provider: Arc<dyn StreamSource>,
    queues: DashMap<SessionId, Arc<Queue>>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn StreamSource>) -> Self {
        Self {
            provider,
            queues: Default::default(),
        }
    }

    /// Creates a queue for a session, returning it along with the sender
    /// the session's sink reports through. Replaces and destroys any
    /// previous queue for the same session.
    pub fn create(
        &self,
        id: SessionId,
        sink: Arc<dyn AudioSink>,
    ) -> (Arc<Queue>, SinkEventSender) {
        let (queue, sender) = Queue::new(self.provider.clone(), sink);

        if let Some(previous) = self.queues.insert(id, queue.clone()) {
            previous.destroy();
        }

        info!("Created queue for session {id}");
        (queue, sender)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Queue>> {
        self.queues.get(&id).map(|queue| queue.clone())
    }

    /// Whether the session currently has a queue.
    pub fn has_active_queue(&self, id: SessionId) -> bool {
        self.queues.contains_key(&id)
    }

    /// Destroys and removes a session's queue, if it has one.
    pub fn destroy(&self, id: SessionId) {
        if let Some((_, queue)) = self.queues.remove(&id) {
            queue.destroy();
            info!("Destroyed queue for session {id}");
        }
    }
}
