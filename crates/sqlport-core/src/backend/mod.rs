//! Engine placement strategies
//!
//! A [`Backend`] turns facade calls into [`Command`]s and delivers them to
//! an engine host, either directly ([`InProcessBackend`]) or across the
//! worker transport ([`WorkerBackend`]). Both share the request/reply
//! plumbing below, so every operation behaves identically whichever
//! placement is chosen.

mod local;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::engine::{ChangeSink, DatabaseHandle, Reply};
use crate::error::{StorageError, StorageResult};
use crate::files::FileRemover;
use crate::stream::ResultStream;
use crate::transport::Command;
use crate::value::Value;

pub use crate::config::BackendKind;
pub use local::InProcessBackend;
pub use worker::WorkerBackend;

/// Command sink in front of an engine host
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which placement this backend implements
    fn kind(&self) -> BackendKind;

    /// Hand a command to the engine host without waiting for its reply
    fn submit(&self, command: Command) -> StorageResult<()>;

    /// Error reported when a reply channel is dropped unanswered
    fn lost_reply(&self) -> StorageError;

    /// Whether the backend can still accept commands
    fn is_alive(&self) -> bool {
        true
    }

    async fn open(&self, path: &Path) -> StorageResult<DatabaseHandle> {
        let path = path.to_path_buf();
        round_trip(self, |reply| Command::Open { path, reply }).await
    }

    async fn close(&self, handle: DatabaseHandle) -> StorageResult<()> {
        round_trip(self, |reply| Command::Close { handle, reply }).await
    }

    async fn execute(
        &self,
        handle: DatabaseHandle,
        sql: &str,
        params: Option<Vec<Value>>,
    ) -> StorageResult<()> {
        let sql = sql.to_string();
        round_trip(self, |reply| Command::Execute {
            handle,
            sql,
            params,
            reply,
        })
        .await
    }

    async fn execute_batch(&self, handle: DatabaseHandle, sql: &str) -> StorageResult<()> {
        let sql = sql.to_string();
        round_trip(self, |reply| Command::ExecuteBatch { handle, sql, reply }).await
    }

    async fn query(
        &self,
        handle: DatabaseHandle,
        sql: &str,
        params: Option<Vec<Value>>,
    ) -> StorageResult<ResultStream> {
        let sql = sql.to_string();
        round_trip(self, |reply| Command::Query {
            handle,
            sql,
            params,
            reply,
        })
        .await
    }

    /// Route a handle's committed changes to `sink`, replacing any
    /// previous sink
    async fn register_update_hook(
        &self,
        handle: DatabaseHandle,
        sink: ChangeSink,
    ) -> StorageResult<()> {
        round_trip(self, |reply| Command::Subscribe {
            handle,
            sink,
            reply,
        })
        .await
    }

    /// Remove the storage of a database that is not open
    async fn destroy(&self, path: &Path) -> StorageResult<()> {
        let path = path.to_path_buf();
        round_trip(self, |reply| Command::Destroy { path, reply }).await
    }
}

/// Submit a command and wait for the reply it carries
async fn round_trip<B, T>(
    backend: &B,
    build: impl FnOnce(Reply<T>) -> Command + Send,
) -> StorageResult<T>
where
    B: Backend + ?Sized,
    T: Send,
{
    let (reply, response) = oneshot::channel();
    backend.submit(build(reply))?;
    response.await.map_err(|_| backend.lost_reply())?
}

/// Start the backend for a placement
///
/// Relative database paths resolve against `root`. The worker backend only
/// accepts relative paths that stay inside it.
pub fn connect(
    kind: BackendKind,
    root: impl Into<PathBuf>,
    files: Arc<dyn FileRemover>,
) -> StorageResult<Arc<dyn Backend>> {
    Ok(match kind {
        BackendKind::InProcess => Arc::new(InProcessBackend::new(root, files)),
        BackendKind::Worker => Arc::new(WorkerBackend::spawn(root, files)?),
    })
}
