//! Unified storage interface
//!
//! The `Store` is the only component applications talk to. It picks a
//! backend once, when constructed, and hides whether the engine runs
//! in-process or on the worker:
//! - `init` opens the primary database, applies the schema and wires up
//!   change notifications
//! - `execute`/`query` pass straight through to the backend
//! - `on_update` registers per-handle change subscribers
//! - `reset` drops and recreates the primary database
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::new(Config::load()?);
//! store.init().await?;
//!
//! let db = store.primary()?;
//! store.on_update(db, |n| println!("{:?}", n))?;
//! store.execute(db, "INSERT INTO accounts ...", None).await?;
//!
//! let rows = store.query_all(db, "SELECT * FROM accounts", None).await?;
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::backend::{self, Backend, BackendKind};
use crate::config::Config;
use crate::engine::DatabaseHandle;
use crate::error::{StorageError, StorageResult};
use crate::event::Notification;
use crate::files::{FileRemover, LocalFiles};
use crate::notifier::{ChangeNotifier, SubscriptionToken};
use crate::schema;
use crate::stream::ResultStream;
use crate::value::{Row, Value};

/// State that exists between `init` and `shutdown`
struct Session {
    backend: Arc<dyn Backend>,
    primary: DatabaseHandle,
    /// Handles opened through this store, with the path they were opened at
    handles: HashMap<DatabaseHandle, PathBuf>,
}

/// Storage facade over the configured backend
pub struct Store {
    config: Config,
    files: Arc<dyn FileRemover>,
    notifier: ChangeNotifier,
    session: Mutex<Option<Session>>,
    /// Serializes init, reset and shutdown
    lifecycle: tokio::sync::Mutex<()>,
}

impl Store {
    /// Create a store; nothing is opened until [`Store::init`]
    pub fn new(config: Config) -> Self {
        Self::with_files(config, Arc::new(LocalFiles))
    }

    /// Create a store with a custom file remover
    pub fn with_files(config: Config, files: Arc<dyn FileRemover>) -> Self {
        Self {
            config,
            files,
            notifier: ChangeNotifier::new(),
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Placement chosen at construction; never changes
    pub fn backend_kind(&self) -> BackendKind {
        self.config.backend
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.session()
            .as_ref()
            .is_some_and(|session| session.backend.is_alive())
    }

    /// Start the backend and open the primary database
    ///
    /// Returns `true` if initialization ran, `false` if the store was
    /// already initialized. A store whose backend died re-initializes.
    pub async fn init(&self) -> StorageResult<bool> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.is_initialized() {
            return Ok(false);
        }
        if self.session().take().is_some() {
            warn!("storage backend died, re-initializing");
            self.notifier.clear();
        }

        let backend = backend::connect(
            self.config.backend,
            self.config.data_dir.clone(),
            Arc::clone(&self.files),
        )?;
        let primary = self.open_with(backend.as_ref(), &self.config.database).await?;

        let mut handles = HashMap::new();
        handles.insert(primary, self.config.database.clone());
        *self.session() = Some(Session {
            backend,
            primary,
            handles,
        });

        info!(
            backend = %self.config.backend,
            database = ?self.config.database_path(),
            "storage initialized"
        );
        Ok(true)
    }

    fn backend(&self) -> StorageResult<Arc<dyn Backend>> {
        self.session()
            .as_ref()
            .map(|session| Arc::clone(&session.backend))
            .ok_or(StorageError::NotInitialized)
    }

    /// Handle of the database opened by `init`
    pub fn primary(&self) -> StorageResult<DatabaseHandle> {
        self.session()
            .as_ref()
            .map(|session| session.primary)
            .ok_or(StorageError::NotInitialized)
    }

    /// Drop the session if the backend reported it is gone
    fn observe<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.session().take().is_some() {
                warn!("storage backend lost: {}", e);
                self.notifier.clear();
            }
        }
        result
    }

    /// Open a database, apply the schema and attach notifications
    async fn open_with(
        &self,
        backend: &dyn Backend,
        path: &Path,
    ) -> StorageResult<DatabaseHandle> {
        let handle = backend.open(path).await?;

        let setup = async {
            schema::apply(backend, handle).await?;
            let sink = self.notifier.attach(handle);
            backend.register_update_hook(handle, sink).await
        };
        if let Err(e) = setup.await {
            if let Err(close_err) = backend.close(handle).await {
                debug!(%handle, "close after failed setup: {}", close_err);
            }
            return Err(e);
        }

        debug!(%handle, ?path, "database ready");
        Ok(handle)
    }

    /// Open an additional database
    pub async fn open(&self, path: impl AsRef<Path>) -> StorageResult<DatabaseHandle> {
        let path = path.as_ref();
        let backend = self.backend()?;
        let handle = self.observe(self.open_with(backend.as_ref(), path).await)?;

        if let Some(session) = self.session().as_mut() {
            session.handles.insert(handle, path.to_path_buf());
        }
        Ok(handle)
    }

    /// Close a database; its subscriptions go quiet
    pub async fn close(&self, handle: DatabaseHandle) -> StorageResult<()> {
        let backend = self.backend()?;
        let result = self.observe(backend.close(handle).await);

        if matches!(result, Ok(()) | Err(StorageError::UnknownHandle(_))) {
            if let Some(session) = self.session().as_mut() {
                session.handles.remove(&handle);
            }
            self.notifier.drop_handle(handle);
        }
        result
    }

    pub fn is_open(&self, handle: DatabaseHandle) -> bool {
        self.session()
            .as_ref()
            .is_some_and(|session| session.handles.contains_key(&handle))
    }

    /// Run statements, discarding any rows
    pub async fn execute(
        &self,
        handle: DatabaseHandle,
        sql: &str,
        params: Option<Vec<Value>>,
    ) -> StorageResult<()> {
        let backend = self.backend()?;
        self.observe(backend.execute(handle, sql, params).await)
    }

    /// Run a parameterless script
    pub async fn execute_batch(&self, handle: DatabaseHandle, sql: &str) -> StorageResult<()> {
        let backend = self.backend()?;
        self.observe(backend.execute_batch(handle, sql).await)
    }

    /// Start a query; rows are produced as the stream is pulled
    pub async fn query(
        &self,
        handle: DatabaseHandle,
        sql: &str,
        params: Option<Vec<Value>>,
    ) -> StorageResult<ResultStream> {
        let backend = self.backend()?;
        self.observe(backend.query(handle, sql, params).await)
    }

    /// Run a query and collect every row
    pub async fn query_all(
        &self,
        handle: DatabaseHandle,
        sql: &str,
        params: Option<Vec<Value>>,
    ) -> StorageResult<Vec<Row>> {
        let stream = self.query(handle, sql, params).await?;
        self.observe(stream.collect_rows().await)
    }

    /// Subscribe to a handle's committed changes and resets
    pub fn on_update<F>(
        &self,
        handle: DatabaseHandle,
        callback: F,
    ) -> StorageResult<SubscriptionToken>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        if !self.is_initialized() {
            return Err(StorageError::NotInitialized);
        }
        if !self.is_open(handle) {
            return Err(StorageError::UnknownHandle(handle));
        }
        Ok(self.notifier.subscribe(handle, callback))
    }

    /// Remove a subscription; returns `false` if it was already gone
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.notifier.unsubscribe(token)
    }

    /// Number of subscribers on a handle
    pub fn subscriber_count(&self, handle: DatabaseHandle) -> usize {
        self.notifier.subscriber_count(handle)
    }

    /// Drop and recreate the primary database
    ///
    /// Subscribers of the old primary handle move to the new one. Every
    /// subscriber of every open handle then receives one
    /// [`Notification::Reset`].
    pub async fn reset(&self) -> StorageResult<DatabaseHandle> {
        let _lifecycle = self.lifecycle.lock().await;

        let (backend, old) = {
            let session = self.session();
            let session = session.as_ref().ok_or(StorageError::NotInitialized)?;
            (Arc::clone(&session.backend), session.primary)
        };
        let path = self.config.database.clone();

        match self.observe(backend.close(old).await) {
            Ok(()) | Err(StorageError::UnknownHandle(_)) => {}
            Err(e) => return Err(e),
        }
        if let Some(session) = self.session().as_mut() {
            session.handles.remove(&old);
        }
        // Changes committed before the close reach the old subscribers
        // before they move and before the reset is announced.
        self.notifier.drain(old).await;

        if let Err(e) = self.observe(backend.destroy(&path).await) {
            warn!("failed to remove database storage: {}", e);
            // Leave a usable primary behind if the backend is still there.
            if self.is_initialized() {
                if let Ok(handle) = self.open_with(backend.as_ref(), &path).await {
                    self.replace_primary(old, handle, &path);
                }
            }
            return Err(e);
        }

        let new = self.observe(self.open_with(backend.as_ref(), &path).await)?;
        self.replace_primary(old, new, &path);
        self.notifier.broadcast(&Notification::Reset);

        info!(old = %old, new = %new, "primary database reset");
        Ok(new)
    }

    fn replace_primary(&self, old: DatabaseHandle, new: DatabaseHandle, path: &Path) {
        if let Some(session) = self.session().as_mut() {
            session.primary = new;
            session.handles.insert(new, path.to_path_buf());
        }
        self.notifier.rekey(old, new);
    }

    /// Close every database and stop the backend
    ///
    /// The store can be initialized again afterwards.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(session) = self.session().take() else {
            return Ok(());
        };
        self.notifier.clear();

        let mut handles: Vec<_> = session.handles.into_keys().collect();
        handles.sort();
        for handle in handles {
            if let Err(e) = session.backend.close(handle).await {
                debug!(%handle, "close during shutdown: {}", e);
            }
        }

        info!("storage shut down");
        Ok(())
    }
}
