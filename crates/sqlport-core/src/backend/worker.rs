//! Worker placement

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use super::{Backend, BackendKind};
use crate::error::{StorageError, StorageResult};
use crate::files::FileRemover;
use crate::transport::{Command, TransportClient, Worker};

/// Engine host on an isolated worker thread, reached over the transport
///
/// The worker only sees paths inside its storage root.
pub struct WorkerBackend {
    client: TransportClient,
    worker: Mutex<Worker>,
}

impl WorkerBackend {
    pub fn spawn(root: impl Into<PathBuf>, files: Arc<dyn FileRemover>) -> StorageResult<Self> {
        let worker = Worker::spawn(root, files)?;
        Ok(Self {
            client: worker.client(),
            worker: Mutex::new(worker),
        })
    }

    /// Stop the worker; outstanding and later commands fail with
    /// [`StorageError::TransportClosed`]
    pub fn terminate(&self) {
        info!("terminating storage worker");
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminate();
    }
}

#[async_trait]
impl Backend for WorkerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Worker
    }

    fn submit(&self, command: Command) -> StorageResult<()> {
        self.client.submit(command)
    }

    fn lost_reply(&self) -> StorageError {
        StorageError::TransportClosed
    }

    fn is_alive(&self) -> bool {
        !self.client.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::LocalFiles;
    use std::path::Path;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_operations_cross_the_transport() {
        let dir = TempDir::new().unwrap();
        let backend = WorkerBackend::spawn(dir.path(), Arc::new(LocalFiles)).unwrap();

        let handle = backend.open(Path::new("w.db")).await.unwrap();
        backend
            .execute_batch(handle, "CREATE TABLE t(id INTEGER PRIMARY KEY)")
            .await
            .unwrap();
        backend
            .execute(handle, "INSERT INTO t VALUES (1), (2)", None)
            .await
            .unwrap();

        let rows = backend
            .query(handle, "SELECT id FROM t ORDER BY id", None)
            .await
            .unwrap()
            .collect_rows()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(backend.kind(), BackendKind::Worker);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_terminate_fails_later_commands() {
        let dir = TempDir::new().unwrap();
        let backend = WorkerBackend::spawn(dir.path(), Arc::new(LocalFiles)).unwrap();
        let handle = backend.open(Path::new("w.db")).await.unwrap();

        backend.terminate();

        assert!(!backend.is_alive());
        let err = backend.execute(handle, "SELECT 1", None).await.unwrap_err();
        assert_eq!(err, StorageError::TransportClosed);
    }
}
