//! board.rs
//!
//! The shared status map every poller and user action writes into.
//!
//! Each write validates the transition against the current value under the
//! lock, so two writers racing on one resource cannot interleave an invalid
//! sequence: the loser gets a `TransitionError` and backs off.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::status::state::{IndexingStatus, ItemStatus, TransitionError};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub resource_id: String,
    pub status: ItemStatus,
}

pub struct StatusBoard {
    entries: Mutex<HashMap<String, ItemStatus>>,
    events: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ItemStatus>> {
        // a panicked writer leaves the map itself intact
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current status; resources nobody acted on are `pristine`.
    pub fn get(&self, resource_id: &str) -> ItemStatus {
        self.lock().get(resource_id).cloned().unwrap_or_default()
    }

    pub fn state(&self, resource_id: &str) -> IndexingStatus {
        self.get(resource_id).state
    }

    /// Resources with something still in flight.
    pub fn in_progress(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, s)| s.state.is_in_progress())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Validated transition. Returns the status it replaced.
    pub fn transition(&self, resource_id: &str, next: ItemStatus) -> Result<ItemStatus, TransitionError> {
        let previous = {
            let mut entries = self.lock();
            let current = entries.get(resource_id).cloned().unwrap_or_default();
            if !current.state.can_transition_to(next.state) {
                return Err(TransitionError {
                    resource_id: resource_id.to_string(),
                    from: current.state,
                    to: next.state,
                });
            }
            write_entry(&mut entries, resource_id, next.clone());
            current
        };
        debug!(resource_id, from = %previous.state, to = %next.state, "status transition");
        self.publish(resource_id, next);
        Ok(previous)
    }

    /// Writes a status rebuilt from membership and the live index.
    ///
    /// A settled indexed status is never pulled back into a polling state and
    /// a failure stays until the user retries. Deriving the current state
    /// again is a no-op that keeps its progress counters.
    pub fn derive(&self, resource_id: &str, next: ItemStatus) -> Result<ItemStatus, TransitionError> {
        let previous = {
            let mut entries = self.lock();
            let current = entries.get(resource_id).cloned().unwrap_or_default();
            if current.state == next.state {
                return Ok(current);
            }
            let blocked = current.state == IndexingStatus::Failed
                || (current.state.is_indexed() && next.state.is_polling());
            if blocked {
                return Err(TransitionError {
                    resource_id: resource_id.to_string(),
                    from: current.state,
                    to: next.state,
                });
            }
            write_entry(&mut entries, resource_id, next.clone());
            current
        };
        debug!(resource_id, from = %previous.state, to = %next.state, "status derived");
        self.publish(resource_id, next);
        Ok(previous)
    }

    /// Unchecked write used to roll an optimistic change back to its snapshot.
    pub fn restore(&self, resource_id: &str, previous: ItemStatus) {
        write_entry(&mut self.lock(), resource_id, previous.clone());
        debug!(resource_id, to = %previous.state, "status restored");
        self.publish(resource_id, previous);
    }

    fn publish(&self, resource_id: &str, status: ItemStatus) {
        // no subscribers is fine
        let _ = self.events.send(StatusEvent {
            resource_id: resource_id.to_string(),
            status,
        });
    }
}

fn write_entry(entries: &mut HashMap<String, ItemStatus>, resource_id: &str, status: ItemStatus) {
    if status.state == IndexingStatus::Pristine {
        entries.remove(resource_id);
    } else {
        entries.insert(resource_id.to_string(), status);
    }
}
