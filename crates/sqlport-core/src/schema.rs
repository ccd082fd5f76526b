//! Application schema
//!
//! Applied with `execute_batch` after every facade `open` and `reset`. All
//! statements are idempotent, so re-applying to an existing database only
//! refreshes the version row.

use crate::backend::Backend;
use crate::engine::DatabaseHandle;
use crate::error::StorageResult;
use crate::value::Value;

/// Schema script
pub const SCHEMA: &str = include_str!("schema.sql");

/// Version recorded in `schema_info` by [`SCHEMA`]
pub const SCHEMA_VERSION: i64 = 1;

/// Apply the schema to an open database
pub async fn apply(backend: &dyn Backend, handle: DatabaseHandle) -> StorageResult<()> {
    backend.execute_batch(handle, SCHEMA).await
}

/// Read the recorded schema version
///
/// Returns `None` if the schema was never applied.
pub async fn version(backend: &dyn Backend, handle: DatabaseHandle) -> StorageResult<Option<i64>> {
    let exists = backend
        .query(
            handle,
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_info'",
            None,
        )
        .await?
        .collect_rows()
        .await?;
    if exists.is_empty() {
        return Ok(None);
    }

    let mut rows = backend
        .query(
            handle,
            "SELECT value FROM schema_info WHERE key = 'version'",
            None,
        )
        .await?;
    let version = rows
        .next()
        .await?
        .and_then(|row| row.get("value").and_then(Value::as_str).and_then(|v| v.parse().ok()));
    Ok(version)
}
