//! Collection and delivery of change notifications.
//!
//! The store reports every mutation here. Outside a transaction the
//! notification is delivered at once; inside one it is buffered and the
//! buffer is flushed after the physical commit, or dropped on rollback.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use pimstore_core::events::ChangeNotification;

/// Receiver of notification batches.
pub trait NotificationSubscriber: Send {
    fn notify(&self, batch: &[ChangeNotification]);
}

impl<F> NotificationSubscriber for F
where
    F: Fn(&[ChangeNotification]) + Send,
{
    fn notify(&self, batch: &[ChangeNotification]) {
        self(batch)
    }
}

/// Forwards every batch into an unbounded channel.
pub struct ChannelSubscriber(pub tokio::sync::mpsc::UnboundedSender<Vec<ChangeNotification>>);

impl NotificationSubscriber for ChannelSubscriber {
    fn notify(&self, batch: &[ChangeNotification]) {
        // A closed receiver just means nobody listens anymore.
        let _ = self.0.send(batch.to_vec());
    }
}

#[derive(Default)]
pub struct NotificationCollector {
    pending: Vec<ChangeNotification>,
    subscribers: Vec<Box<dyn NotificationSubscriber>>,
}

impl NotificationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl NotificationSubscriber + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    /// Notifications waiting for the current transaction to commit.
    pub fn pending(&self) -> &[ChangeNotification] {
        &self.pending
    }

    pub fn collect(&mut self, notification: ChangeNotification, in_transaction: bool) {
        if in_transaction {
            self.append_and_compress(notification);
        } else {
            self.dispatch(&[notification]);
        }
    }

    /// Collection changes are merged into a pending change or addition of
    /// the same collection.
    fn append_and_compress(&mut self, notification: ChangeNotification) {
        if let ChangeNotification::CollectionChanged {
            collection_id,
            changes,
        } = &notification
        {
            for pending in self.pending.iter_mut() {
                match pending {
                    ChangeNotification::CollectionAdded {
                        collection_id: added,
                        ..
                    } if added == collection_id => return,
                    ChangeNotification::CollectionChanged {
                        collection_id: changed,
                        changes: existing,
                    } if changed == collection_id => {
                        existing.extend(changes.iter().cloned());
                        return;
                    }
                    _ => {}
                }
            }
        }
        self.pending.push(notification);
    }

    pub fn transaction_committed(&mut self) {
        let batch = std::mem::take(&mut self.pending);
        self.dispatch(&batch);
    }

    pub fn transaction_rolled_back(&mut self) {
        if !self.pending.is_empty() {
            debug!(dropped = self.pending.len(), "Discarding notifications of rolled back transaction");
        }
        self.pending.clear();
    }

    fn dispatch(&self, batch: &[ChangeNotification]) {
        if batch.is_empty() {
            return;
        }
        debug!(
            count = batch.len(),
            first = batch[0].event_name(),
            "Dispatching change notifications"
        );
        if tracing::enabled!(tracing::Level::TRACE) {
            match serde_json::to_string(batch) {
                Ok(json) => trace!(payload = %json, "Notification batch"),
                Err(e) => trace!(error = %e, "Notification batch not serializable"),
            }
        }
        for subscriber in &self.subscribers {
            subscriber.notify(batch);
        }
    }
}

impl std::fmt::Debug for NotificationCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationCollector")
            .field("pending", &self.pending.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// Convenience for building change sets.
pub fn change_set<I, S>(names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}
