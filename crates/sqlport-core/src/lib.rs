//! SQLPort Core Library
//!
//! This crate provides a storage access layer for an embedded SQLite
//! engine that behaves identically whether the engine runs in the calling
//! process or on an isolated worker reached over a command transport.
//!
//! # Architecture
//!
//! - **Engine host**: owns every connection; one worker thread per handle
//!   serializes the work on that handle
//! - **Transport**: commands with one-shot reply channels
//! - **Result streams**: rows are produced one pull at a time
//! - **Change notifier**: per-handle subscribers for committed mutations
//! - **Store**: the facade applications use
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::new(Config::load()?);
//! store.init().await?;
//!
//! let db = store.primary()?;
//! store.on_update(db, |n| println!("{:?}", n))?;
//! store.execute(db, "INSERT INTO accounts (public_key, name, created_at) VALUES (?, ?, ?)",
//!     Some(vec![vec![1u8].into(), "alice".into(), 0.into()])).await?;
//!
//! let mut rows = store.query(db, "SELECT name FROM accounts", None).await?;
//! while let Some(row) = rows.next().await? {
//!     println!("{}", row.to_json());
//! }
//! ```
//!
//! # Modules
//!
//! - `store`: Storage facade (main entry point)
//! - `backend`: In-process and worker placements
//! - `engine`: Engine host and connection workers
//! - `transport`: Commands and the worker thread
//! - `stream`: Lazy result streams
//! - `notifier`: Change subscriptions
//! - `config`: Application configuration

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod files;
pub mod notifier;
pub mod schema;
pub mod store;
pub mod stream;
pub mod transport;
pub mod value;

pub use backend::{Backend, BackendKind, InProcessBackend, WorkerBackend};
pub use config::Config;
pub use engine::{DatabaseHandle, EngineHost, MEMORY_PATH};
pub use error::{StorageError, StorageResult};
pub use event::{ChangeEvent, ChangeKind, Notification};
pub use files::{FileRemover, LocalFiles};
pub use notifier::{ChangeNotifier, SubscriptionToken};
pub use store::Store;
pub use stream::ResultStream;
pub use value::{params_from_json, Row, Value};
