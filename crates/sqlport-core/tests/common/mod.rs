#![allow(dead_code)]

use std::time::Duration;

use sqlport_core::{BackendKind, Config, DatabaseHandle, Notification, Store, SubscriptionToken};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const BACKENDS: [BackendKind; 2] = [BackendKind::InProcess, BackendKind::Worker];

/// How long to wait for an asynchronous notification
pub const WAIT: Duration = Duration::from_secs(5);

/// An initialized store rooted in its own temporary directory
pub struct Fixture {
    pub store: Store,
    pub dir: TempDir,
}

pub async fn fixture(kind: BackendKind) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_data_dir(dir.path());
    config.backend = kind;
    let store = Store::new(config);
    assert!(store.init().await.unwrap());
    Fixture { store, dir }
}

/// Subscribe and forward every notification into a channel
pub fn watch(
    store: &Store,
    handle: DatabaseHandle,
) -> (SubscriptionToken, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = store
        .on_update(handle, move |notification| {
            let _ = tx.send(notification.clone());
        })
        .unwrap();
    (token, rx)
}

/// Next notification, failing the test if none arrives in time
pub async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification channel closed")
}

/// Assert that nothing else arrives for a short while
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Notification>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected notification: {:?}", extra);
}
