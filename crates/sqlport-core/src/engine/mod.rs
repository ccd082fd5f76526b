//! Engine host
//!
//! The only component that touches `rusqlite::Connection`. Each open
//! connection is owned by a dedicated connection worker thread (see
//! [`actor`]) with a FIFO mailbox, which serializes every operation on that
//! handle while different handles run concurrently.
//!
//! The host itself only routes: opening and destroying databases happens
//! inline, everything else is forwarded to the owning worker together with
//! the caller's reply channel.

mod actor;
pub(crate) mod sql;

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::event::ChangeEvent;
use crate::files::{remove_database, FileRemover};
use crate::transport::Command;

pub(crate) use actor::Request;
use actor::ConnectionActor;

/// Path that opens a private in-memory database
pub const MEMORY_PATH: &str = ":memory:";

/// One-shot reply channel carried by every command
pub type Reply<T> = oneshot::Sender<StorageResult<T>>;

/// Receiving end for a handle's committed mutations
pub type ChangeSink = mpsc::UnboundedSender<ChangeEvent>;

/// Opaque identifier of an open connection
///
/// Handles are never reused by the host that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseHandle(u64);

impl DatabaseHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db#{}", self.0)
    }
}

/// Owner of every live engine connection
pub struct EngineHost {
    root: PathBuf,
    sandboxed: bool,
    files: Arc<dyn FileRemover>,
    next_handle: u64,
    connections: HashMap<DatabaseHandle, ConnectionActor>,
}

impl EngineHost {
    /// Create a host resolving relative paths against `root`
    ///
    /// Absolute paths are used as given.
    pub fn new(root: impl Into<PathBuf>, files: Arc<dyn FileRemover>) -> Self {
        Self {
            root: root.into(),
            sandboxed: false,
            files,
            next_handle: 0,
            connections: HashMap::new(),
        }
    }

    /// Create a host confined to `root`
    ///
    /// Only relative paths without `..` components are accepted, the way a
    /// worker only sees its private storage.
    pub fn sandboxed(root: impl Into<PathBuf>, files: Arc<dyn FileRemover>) -> Self {
        Self {
            sandboxed: true,
            ..Self::new(root, files)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    pub fn is_open(&self, handle: DatabaseHandle) -> bool {
        self.connections.contains_key(&handle)
    }

    /// Handles of all open connections, in ascending order
    pub fn open_handles(&self) -> Vec<DatabaseHandle> {
        let mut handles: Vec<_> = self.connections.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Resolve a database path; `None` means in-memory
    pub fn resolve(&self, path: &Path) -> StorageResult<Option<PathBuf>> {
        if path == Path::new(MEMORY_PATH) {
            return Ok(None);
        }

        if self.sandboxed {
            let confined = path
                .components()
                .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
            if !confined || path.as_os_str().is_empty() {
                return Err(StorageError::EngineUnavailable {
                    path: path.to_path_buf(),
                    message: "path is outside the worker's storage root".to_string(),
                });
            }
        }

        Ok(Some(self.root.join(path)))
    }

    /// Open or create a database and start its connection worker
    pub fn open(&mut self, path: &Path) -> StorageResult<DatabaseHandle> {
        let resolved = self.resolve(path)?;
        let unavailable = |message: String| StorageError::EngineUnavailable {
            path: path.to_path_buf(),
            message,
        };

        let conn = match &resolved {
            None => Connection::open_in_memory().map_err(|e| unavailable(e.to_string()))?,
            Some(file) => {
                if let Some(parent) = file.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        unavailable(format!("cannot create directory {:?}: {}", parent, e))
                    })?;
                }
                Connection::open(file).map_err(|e| unavailable(e.to_string()))?
            }
        };

        // Opening is lazy; touch the header so unreadable files fail here.
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .and_then(|_| conn.pragma_query_value(None, "schema_version", |row| row.get::<_, i64>(0)))
            .map_err(|e| unavailable(e.to_string()))?;

        self.next_handle += 1;
        let handle = DatabaseHandle(self.next_handle);
        let actor = ConnectionActor::spawn(handle, conn, resolved.clone())?;
        self.connections.insert(handle, actor);

        info!(%handle, path = ?resolved, "opened database");
        Ok(handle)
    }

    /// Close a connection; the reply arrives once the worker released it
    pub fn close(&mut self, handle: DatabaseHandle, reply: Reply<()>) {
        let Some(actor) = self.connections.remove(&handle) else {
            let _ = reply.send(Err(StorageError::UnknownHandle(handle)));
            return;
        };

        debug!(%handle, "closing database");
        if let Err(request) = actor.send(Request::Close { reply }) {
            // The worker is already gone and took the connection with it.
            if let Request::Close { reply } = request {
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Remove the storage of a database that is not open
    pub fn destroy(&self, path: &Path) -> StorageResult<()> {
        let Some(file) = self.resolve(path)? else {
            return Ok(());
        };

        if self
            .connections
            .values()
            .any(|actor| actor.path() == Some(file.as_path()))
        {
            return Err(StorageError::Engine(format!(
                "database {:?} is still open",
                path
            )));
        }

        remove_database(self.files.as_ref(), &file)?;
        info!(path = ?file, "removed database storage");
        Ok(())
    }

    /// Execute one command, answering on its reply channel
    pub fn dispatch(&mut self, command: Command) {
        match command {
            Command::Open { path, reply } => {
                let _ = reply.send(self.open(&path));
            }
            Command::Close { handle, reply } => self.close(handle, reply),
            Command::Execute {
                handle,
                sql,
                params,
                reply,
            } => self.route(handle, Request::Execute { sql, params, reply }),
            Command::ExecuteBatch { handle, sql, reply } => {
                self.route(handle, Request::ExecuteBatch { sql, reply })
            }
            Command::Query {
                handle,
                sql,
                params,
                reply,
            } => self.route(handle, Request::Query { sql, params, reply }),
            Command::Subscribe {
                handle,
                sink,
                reply,
            } => self.route(handle, Request::SetSink { sink, reply }),
            Command::Destroy { path, reply } => {
                let _ = reply.send(self.destroy(&path));
            }
        }
    }

    fn route(&mut self, handle: DatabaseHandle, request: Request) {
        let Some(actor) = self.connections.get(&handle) else {
            request.reject(StorageError::UnknownHandle(handle));
            return;
        };

        if let Err(request) = actor.send(request) {
            warn!(%handle, "connection worker exited unexpectedly");
            self.connections.remove(&handle);
            request.reject(StorageError::UnknownHandle(handle));
        }
    }
}
