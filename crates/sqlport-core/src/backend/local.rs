//! In-process placement

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Backend, BackendKind};
use crate::engine::{DatabaseHandle, EngineHost};
use crate::error::{StorageError, StorageResult};
use crate::files::FileRemover;
use crate::transport::Command;

/// Engine host living in the calling process
///
/// Commands are dispatched inline; the per-handle connection workers do the
/// actual work. Opening and destroying touch the file system and run on
/// the blocking pool.
pub struct InProcessBackend {
    host: Arc<Mutex<EngineHost>>,
}

impl InProcessBackend {
    pub fn new(root: impl Into<PathBuf>, files: Arc<dyn FileRemover>) -> Self {
        Self {
            host: Arc::new(Mutex::new(EngineHost::new(root, files))),
        }
    }

    fn host(&self) -> MutexGuard<'_, EngineHost> {
        lock(&self.host)
    }

    async fn blocking<T, F>(&self, work: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineHost) -> StorageResult<T> + Send + 'static,
    {
        let host = Arc::clone(&self.host);
        tokio::task::spawn_blocking(move || work(&mut lock(&host)))
            .await
            .map_err(|e| StorageError::Engine(format!("engine task failed: {}", e)))?
    }
}

fn lock(host: &Mutex<EngineHost>) -> MutexGuard<'_, EngineHost> {
    host.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Backend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    fn submit(&self, command: Command) -> StorageResult<()> {
        self.host().dispatch(command);
        Ok(())
    }

    fn lost_reply(&self) -> StorageError {
        StorageError::Engine("connection worker exited".to_string())
    }

    async fn open(&self, path: &Path) -> StorageResult<DatabaseHandle> {
        let path = path.to_path_buf();
        self.blocking(move |host| host.open(&path)).await
    }

    async fn destroy(&self, path: &Path) -> StorageResult<()> {
        let path = path.to_path_buf();
        self.blocking(move |host| host.destroy(&path)).await
    }
}
