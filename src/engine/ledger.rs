use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::debug;

use super::{ChatId, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Admitted and queued or in flight
    Pending,
    /// Done for the lifetime of the process
    Committed,
}

#[derive(Default)]
struct Entries {
    states: HashMap<(ChatId, MessageId), EntryState>,
    /// Commit order, oldest first; only used when a capacity is set
    committed_order: VecDeque<(ChatId, MessageId)>,
}

/// In-memory admission control for reaction dispatch.
///
/// Nothing is persisted: a restart starts from an empty ledger. Without a
/// capacity the ledger grows for the lifetime of the process.
pub struct DedupLedger {
    entries: Mutex<Entries>,
    capacity: Option<usize>,
}

impl DedupLedger {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity,
        }
    }

    /// Insert a pending entry unless the pair is already known.
    /// Returns true if the caller now owns the pair.
    pub async fn try_admit(&self, chat_id: ChatId, message_id: MessageId) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.states.contains_key(&(chat_id, message_id)) {
            return false;
        }
        entries
            .states
            .insert((chat_id, message_id), EntryState::Pending);
        true
    }

    /// Mark the pair as permanently done
    pub async fn commit(&self, chat_id: ChatId, message_id: MessageId) {
        let mut entries = self.entries.lock().await;
        let previous = entries
            .states
            .insert((chat_id, message_id), EntryState::Committed);
        if previous == Some(EntryState::Committed) {
            return;
        }

        if let Some(capacity) = self.capacity {
            entries.committed_order.push_back((chat_id, message_id));
            while entries.committed_order.len() > capacity {
                let Some(oldest) = entries.committed_order.pop_front() else {
                    break;
                };
                if entries.states.get(&oldest) == Some(&EntryState::Committed) {
                    entries.states.remove(&oldest);
                    debug!("Evicted ledger entry {:?}", oldest);
                }
            }
        }
    }

    /// Forget a pending pair so a later notification can admit it again.
    /// Committed pairs are left alone.
    pub async fn release(&self, chat_id: ChatId, message_id: MessageId) {
        let mut entries = self.entries.lock().await;
        if entries.states.get(&(chat_id, message_id)) == Some(&EntryState::Pending) {
            entries.states.remove(&(chat_id, message_id));
        }
    }

    #[cfg(test)]
    pub async fn state(&self, chat_id: ChatId, message_id: MessageId) -> Option<EntryState> {
        self.entries
            .lock()
            .await
            .states
            .get(&(chat_id, message_id))
            .copied()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.states.len()
    }
}
