//! Change notification fan-out
//!
//! Each open handle can have any number of subscribers. Events arriving on
//! a handle's change sink are dispatched from a tokio task to every
//! subscriber registered at the time of dispatch, in the order the engine
//! committed them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{ChangeSink, DatabaseHandle};
use crate::event::Notification;

/// Subscriber callback
pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Identifies one registration returned by [`ChangeNotifier::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<DatabaseHandle, Vec<(u64, Callback)>>,
    /// Dispatch task of every attached handle
    tasks: HashMap<DatabaseHandle, JoinHandle<()>>,
}

/// Per-handle subscriber registry
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    registry: Arc<Mutex<Registry>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback for a handle's notifications
    pub fn subscribe<F>(&self, handle: DatabaseHandle, callback: F) -> SubscriptionToken
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .subscribers
            .entry(handle)
            .or_default()
            .push((id, Arc::new(callback)));
        SubscriptionToken(id)
    }

    /// Remove one registration
    ///
    /// Returns `false` if it was already gone.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut registry = self.registry();
        for callbacks in registry.subscribers.values_mut() {
            if let Some(index) = callbacks.iter().position(|(id, _)| *id == token.0) {
                callbacks.remove(index);
                return true;
            }
        }
        false
    }

    /// Forget every subscriber of a closed handle
    pub fn drop_handle(&self, handle: DatabaseHandle) {
        let mut registry = self.registry();
        registry.tasks.remove(&handle);
        if let Some(callbacks) = registry.subscribers.remove(&handle) {
            debug!(%handle, count = callbacks.len(), "dropped subscriptions");
        }
    }

    /// Move subscribers from a replaced handle to its successor
    pub fn rekey(&self, from: DatabaseHandle, to: DatabaseHandle) {
        let mut registry = self.registry();
        if let Some(mut moved) = registry.subscribers.remove(&from) {
            registry.subscribers.entry(to).or_default().append(&mut moved);
        }
    }

    /// Forget every subscriber
    pub fn clear(&self) {
        let mut registry = self.registry();
        registry.subscribers.clear();
        registry.tasks.clear();
    }

    pub fn subscriber_count(&self, handle: DatabaseHandle) -> usize {
        self.registry()
            .subscribers
            .get(&handle)
            .map_or(0, Vec::len)
    }

    /// Deliver a notification to a handle's current subscribers
    pub fn dispatch(&self, handle: DatabaseHandle, notification: &Notification) {
        let callbacks: Vec<Callback> = match self.registry().subscribers.get(&handle) {
            Some(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };
        for callback in callbacks {
            callback(notification);
        }
    }

    /// Deliver a notification to every subscriber of every handle
    pub fn broadcast(&self, notification: &Notification) {
        let callbacks: Vec<Callback> = self
            .registry()
            .subscribers
            .values()
            .flatten()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(notification);
        }
    }

    /// Create the sink a handle's committed changes are sent to
    ///
    /// Must be called within a tokio runtime. The dispatch task ends when
    /// the engine drops the sink.
    pub fn attach(&self, handle: DatabaseHandle) -> ChangeSink {
        let (sink, mut events) = mpsc::unbounded_channel();
        let notifier = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                notifier.dispatch(handle, &Notification::Change(event));
            }
            debug!(%handle, "change sink closed");
        });
        self.registry().tasks.insert(handle, task);
        sink
    }

    /// Wait until every change sent on a handle's sink has been dispatched
    ///
    /// Only returns once the engine dropped the sink, i.e. after the handle
    /// was closed.
    pub async fn drain(&self, handle: DatabaseHandle) {
        let task = self.registry().tasks.remove(&handle);
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(%handle, "change dispatch task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChangeEvent, ChangeKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counter(
        notifier: &ChangeNotifier,
        handle: DatabaseHandle,
    ) -> (Arc<AtomicUsize>, SubscriptionToken) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let token = notifier.subscribe(handle, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, token)
    }

    fn insert(row_id: i64) -> Notification {
        Notification::Change(ChangeEvent {
            change_kind: ChangeKind::Insert,
            database_name: Some("main".to_string()),
            table_name: Some("t".to_string()),
            row_id,
        })
    }

    #[test]
    fn test_every_subscriber_receives_dispatch() {
        let notifier = ChangeNotifier::new();
        let handle = DatabaseHandle::from_raw(1);
        let (a, _) = counter(&notifier, handle);
        let (b, _) = counter(&notifier, handle);

        notifier.dispatch(handle, &insert(1));

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_exactly_one() {
        let notifier = ChangeNotifier::new();
        let handle = DatabaseHandle::from_raw(1);
        let (a, first) = counter(&notifier, handle);
        let (b, _) = counter(&notifier, handle);

        assert!(notifier.unsubscribe(first));
        assert!(!notifier.unsubscribe(first));
        assert_eq!(notifier.subscriber_count(handle), 1);

        notifier.dispatch(handle, &insert(1));
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_is_per_handle() {
        let notifier = ChangeNotifier::new();
        let (a, _) = counter(&notifier, DatabaseHandle::from_raw(1));
        let (b, _) = counter(&notifier, DatabaseHandle::from_raw(2));

        notifier.dispatch(DatabaseHandle::from_raw(2), &insert(1));
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        notifier.broadcast(&Notification::Reset);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rekey_and_drop_handle() {
        let notifier = ChangeNotifier::new();
        let old = DatabaseHandle::from_raw(1);
        let new = DatabaseHandle::from_raw(2);
        let (count, token) = counter(&notifier, old);

        notifier.rekey(old, new);
        assert_eq!(notifier.subscriber_count(old), 0);
        notifier.dispatch(new, &insert(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        notifier.drop_handle(new);
        notifier.dispatch(new, &insert(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!notifier.unsubscribe(token));
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let notifier = ChangeNotifier::new();
        let handle = DatabaseHandle::from_raw(1);
        let inner = notifier.clone();
        let slot: Arc<Mutex<Option<SubscriptionToken>>> = Arc::new(Mutex::new(None));
        let own = Arc::clone(&slot);
        let token = notifier.subscribe(handle, move |_| {
            if let Some(token) = own.lock().unwrap().take() {
                inner.unsubscribe(token);
            }
        });
        *slot.lock().unwrap() = Some(token);

        notifier.dispatch(handle, &insert(1));
        assert_eq!(notifier.subscriber_count(handle), 0);
    }

    #[tokio::test]
    async fn test_attached_sink_dispatches_in_order() {
        let notifier = ChangeNotifier::new();
        let handle = DatabaseHandle::from_raw(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        notifier.subscribe(handle, move |n| {
            if let Some(event) = n.as_change() {
                record.lock().unwrap().push(event.row_id);
            }
        });

        let sink = notifier.attach(handle);
        for row_id in 1..=3 {
            if let Notification::Change(event) = insert(row_id) {
                sink.send(event).unwrap();
            }
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_drain_waits_for_queued_events() {
        let notifier = ChangeNotifier::new();
        let handle = DatabaseHandle::from_raw(1);
        let (count, _) = counter(&notifier, handle);

        let sink = notifier.attach(handle);
        for row_id in 1..=50 {
            if let Notification::Change(event) = insert(row_id) {
                sink.send(event).unwrap();
            }
        }
        drop(sink);

        notifier.drain(handle).await;
        assert_eq!(count.load(Ordering::SeqCst), 50);
        // Nothing left to wait for.
        notifier.drain(handle).await;
    }
}
