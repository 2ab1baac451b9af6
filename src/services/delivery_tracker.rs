//! In-memory delivery state table with observer notification.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;

use super::chat_types::{DeliveryState, StatusUpdate};

/// Receives every applied delivery state transition.
///
/// Called synchronously from inside `DeliveryTracker::transition` while the
/// table lock is held. Implementations must not call back into the tracker;
/// hand the update off to another thread or channel instead.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, update: &StatusUpdate);

    /// A closed observer is dropped on the next notification or subscribe.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusUpdate) + Send + Sync,
{
    fn on_status(&self, update: &StatusUpdate) {
        self(update)
    }
}

/// Forwards updates into an unbounded channel.
struct ChannelObserver {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl StatusObserver for ChannelObserver {
    fn on_status(&self, update: &StatusUpdate) {
        let _ = self.tx.send(update.clone());
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One tracked send.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message_id: String,
    /// `None` until the first transition to `Sending`.
    pub state: Option<DeliveryState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub recipient: String,
    /// Cleared once the message settles.
    pub payload: String,
    pub last_error: Option<String>,
}

impl PendingMessage {
    /// Delivered, read or failed: no send for this id is still outstanding.
    pub fn is_settled(&self) -> bool {
        self.state
            .is_some_and(|s| s == DeliveryState::Delivered || s.is_terminal())
    }
}

/// Table of in-flight and completed sends, keyed by message id.
#[derive(Default)]
pub struct DeliveryTracker {
    entries: Mutex<HashMap<String, PendingMessage>>,
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.retain(|o| !o.is_closed());
        observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Subscribe with a channel instead of a callback.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<StatusUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(ChannelObserver { tx }));
        rx
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, PendingMessage>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a message. Returns `false` if the id is already known.
    pub fn register(&self, message_id: &str, recipient: &str, payload: &str) -> bool {
        let mut entries = self.lock_entries();
        if entries.contains_key(message_id) {
            log::warn!("Message id {} already registered; ignoring", message_id);
            return false;
        }
        let now = Utc::now();
        entries.insert(
            message_id.to_string(),
            PendingMessage {
                message_id: message_id.to_string(),
                state: None,
                created_at: now,
                updated_at: now,
                recipient: recipient.to_string(),
                payload: payload.to_string(),
                last_error: None,
            },
        );
        true
    }

    /// Move a message to `new_state` and notify observers.
    ///
    /// Unknown ids (e.g. from a previous process lifetime) and edges that the
    /// state graph does not allow are ignored. Returns whether the transition
    /// was applied.
    pub fn transition(
        &self,
        message_id: &str,
        new_state: DeliveryState,
        detail: Option<String>,
    ) -> bool {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(message_id) else {
            log::debug!("Status {} for unknown message {}", new_state, message_id);
            return false;
        };

        if !DeliveryState::can_follow(entry.state, new_state) {
            log::warn!(
                "Rejected transition for {}: {:?} -> {}",
                message_id,
                entry.state,
                new_state
            );
            return false;
        }

        entry.state = Some(new_state);
        entry.updated_at = Utc::now();
        if detail.is_some() {
            entry.last_error = detail.clone();
        }
        if entry.is_settled() {
            entry.payload = String::new();
        }

        let update = StatusUpdate {
            message_id: message_id.to_string(),
            state: new_state,
            detail,
        };
        log::info!("Message {} -> {}", message_id, new_state);

        let mut any_closed = false;
        {
            let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
            for observer in observers.iter() {
                if observer.is_closed() {
                    any_closed = true;
                    continue;
                }
                observer.on_status(&update);
            }
        }
        if any_closed {
            self.observers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|o| !o.is_closed());
        }
        true
    }

    pub fn get_state(&self, message_id: &str) -> Option<DeliveryState> {
        self.lock_entries().get(message_id).and_then(|e| e.state)
    }

    pub fn snapshot(&self, message_id: &str) -> Option<PendingMessage> {
        self.lock_entries().get(message_id).cloned()
    }

    /// Mark a delivered message as read. Only succeeds from `Delivered`.
    pub fn mark_read(&self, message_id: &str) -> bool {
        self.transition(message_id, DeliveryState::Read, None)
    }

    /// Forget settled entries last updated before `cutoff`. Returns how many
    /// were removed; a pruned id reads as unknown afterwards.
    pub fn prune_settled(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, e| !(e.is_settled() && e.updated_at < cutoff));
        let removed = before - entries.len();
        if removed > 0 {
            log::debug!("Pruned {} settled messages", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }
}
