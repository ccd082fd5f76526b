//! Command transport between a backend and an engine host
//!
//! Every [`Command`] carries its own one-shot reply channel, so replies can
//! never be matched to the wrong request and commands can be pipelined
//! without waiting for earlier replies. The worker side runs an
//! [`EngineHost`] on a dedicated thread and dispatches commands in arrival
//! order.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::engine::{ChangeSink, DatabaseHandle, EngineHost, Reply};
use crate::error::{StorageError, StorageResult};
use crate::files::FileRemover;
use crate::stream::ResultStream;
use crate::value::Value;

/// A request for the engine host
pub enum Command {
    Open {
        path: PathBuf,
        reply: Reply<DatabaseHandle>,
    },
    Close {
        handle: DatabaseHandle,
        reply: Reply<()>,
    },
    Execute {
        handle: DatabaseHandle,
        sql: String,
        params: Option<Vec<Value>>,
        reply: Reply<()>,
    },
    ExecuteBatch {
        handle: DatabaseHandle,
        sql: String,
        reply: Reply<()>,
    },
    Query {
        handle: DatabaseHandle,
        sql: String,
        params: Option<Vec<Value>>,
        reply: Reply<ResultStream>,
    },
    /// Install (or replace) the handle's change sink
    Subscribe {
        handle: DatabaseHandle,
        sink: ChangeSink,
        reply: Reply<()>,
    },
    /// Remove the storage of a closed database
    Destroy {
        path: PathBuf,
        reply: Reply<()>,
    },
}

impl Command {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::Open { .. } => "open",
            Command::Close { .. } => "close",
            Command::Execute { .. } => "execute",
            Command::ExecuteBatch { .. } => "execute_batch",
            Command::Query { .. } => "query",
            Command::Subscribe { .. } => "subscribe",
            Command::Destroy { .. } => "destroy",
        }
    }
}

enum Envelope {
    Command(Command),
    Terminate,
}

/// Sending half of the transport
#[derive(Clone)]
pub struct TransportClient {
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl TransportClient {
    /// Send a command built around a fresh reply channel
    pub fn send<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> StorageResult<oneshot::Receiver<StorageResult<T>>> {
        let (reply, response) = oneshot::channel();
        self.outbound
            .send(Envelope::Command(build(reply)))
            .map_err(|_| StorageError::TransportClosed)?;
        Ok(response)
    }

    /// Send a command and wait for its reply
    pub async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> StorageResult<T> {
        let response = self.send(build)?;
        response.await.map_err(|_| StorageError::TransportClosed)?
    }

    /// Forward an already-built command
    pub fn submit(&self, command: Command) -> StorageResult<()> {
        self.outbound
            .send(Envelope::Command(command))
            .map_err(|_| StorageError::TransportClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// A worker thread running its own engine host
///
/// Dropping the worker terminates it.
pub struct Worker {
    client: TransportClient,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Start a sandboxed engine host rooted at `root`
    pub fn spawn(root: impl Into<PathBuf>, files: Arc<dyn FileRemover>) -> StorageResult<Self> {
        let root = root.into();
        let (outbound, inbound) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name("sqlport-worker".to_string())
            .spawn(move || serve(EngineHost::sandboxed(root, files), inbound))
            .map_err(|e| StorageError::Engine(format!("failed to start storage worker: {}", e)))?;

        Ok(Self {
            client: TransportClient { outbound },
            thread: Some(thread),
        })
    }

    pub fn client(&self) -> TransportClient {
        self.client.clone()
    }

    /// Stop the worker; every outstanding command resolves with
    /// [`StorageError::TransportClosed`]
    pub fn terminate(&mut self) {
        let _ = self.client.outbound.send(Envelope::Terminate);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("storage worker panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn serve(mut host: EngineHost, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
    info!(root = ?host.root(), "storage worker started");

    while let Some(envelope) = inbound.blocking_recv() {
        match envelope {
            Envelope::Command(command) => {
                debug!(command = command.name(), "dispatching");
                host.dispatch(command);
            }
            Envelope::Terminate => break,
        }
    }

    // Commands still queued are dropped with their reply channels.
    inbound.close();
    drop(inbound);
    drop(host);
    info!("storage worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::LocalFiles;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let worker = Worker::spawn(dir.path(), Arc::new(LocalFiles)).unwrap();
        let client = worker.client();

        let handle = client
            .request(|reply| Command::Open {
                path: PathBuf::from("t.db"),
                reply,
            })
            .await
            .unwrap();
        client
            .request(|reply| Command::ExecuteBatch {
                handle,
                sql: "CREATE TABLE t(id INTEGER PRIMARY KEY)".to_string(),
                reply,
            })
            .await
            .unwrap();

        assert!(dir.path().join("t.db").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pipelined_commands_keep_order() {
        let dir = TempDir::new().unwrap();
        let worker = Worker::spawn(dir.path(), Arc::new(LocalFiles)).unwrap();
        let client = worker.client();

        let handle = client
            .request(|reply| Command::Open {
                path: PathBuf::from(crate::engine::MEMORY_PATH),
                reply,
            })
            .await
            .unwrap();

        let create = client
            .send(|reply| Command::ExecuteBatch {
                handle,
                sql: "CREATE TABLE t(v)".to_string(),
                reply,
            })
            .unwrap();
        let insert = client
            .send(|reply| Command::Execute {
                handle,
                sql: "INSERT INTO t VALUES (?)".to_string(),
                params: Some(vec![Value::from("x")]),
                reply,
            })
            .unwrap();
        let query = client
            .send(|reply| Command::Query {
                handle,
                sql: "SELECT v FROM t".to_string(),
                params: None,
                reply,
            })
            .unwrap();

        create.await.unwrap().unwrap();
        insert.await.unwrap().unwrap();
        let rows = query.await.unwrap().unwrap().collect_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("v").and_then(Value::as_str), Some("x"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_terminated_worker_closes_transport() {
        let dir = TempDir::new().unwrap();
        let mut worker = Worker::spawn(dir.path(), Arc::new(LocalFiles)).unwrap();
        let client = worker.client();

        worker.terminate();
        assert!(!worker.is_running());

        let err = client
            .request(|reply| Command::Open {
                path: PathBuf::from("t.db"),
                reply,
            })
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::TransportClosed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_is_sandboxed() {
        let dir = TempDir::new().unwrap();
        let worker = Worker::spawn(dir.path(), Arc::new(LocalFiles)).unwrap();

        let err = worker
            .client()
            .request(|reply| Command::Open {
                path: PathBuf::from("../escape.db"),
                reply,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EngineUnavailable { .. }));
    }
}
