//! Watch command handler
//!
//! Applies statements to the primary database and prints the change
//! notifications they produce.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use sqlport_core::Store;

use crate::output::Output;

/// How long to wait for trailing notifications once statements ran
const SETTLE: Duration = Duration::from_millis(250);

pub async fn watch(store: &Store, statements: &[String], output: &Output) -> Result<()> {
    let db = store.primary()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let token = store.on_update(db, move |notification| {
        let _ = tx.send(notification.clone());
    })?;

    for sql in statements {
        store
            .execute(db, sql, None)
            .await
            .with_context(|| format!("Statement failed: {}", sql))?;
    }

    while let Ok(Some(notification)) = tokio::time::timeout(SETTLE, rx.recv()).await {
        output.print_notification(&notification);
    }

    store.unsubscribe(token);
    Ok(())
}
