//! File removal for destroyed databases
//!
//! The engine host never deletes files itself; it asks a [`FileRemover`],
//! so tests and sandboxed hosts can substitute their own implementation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Side files SQLite may keep next to a database
pub const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// File-system operations needed to destroy database storage
pub trait FileRemover: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn remove(&self, path: &Path) -> io::Result<()>;

    fn remove_recursive(&self, path: &Path) -> io::Result<()>;
}

/// [`FileRemover`] backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFiles;

impl FileRemover for LocalFiles {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_recursive(&self, path: &Path) -> io::Result<()> {
        if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }
}

/// Remove a database and its side files
///
/// A directory is removed recursively. Missing files are not an error.
pub fn remove_database(files: &dyn FileRemover, path: &Path) -> StorageResult<()> {
    if path.is_dir() {
        debug!(?path, "removing database directory");
        return files
            .remove_recursive(path)
            .map_err(|e| StorageError::from_io(e, path.to_path_buf()));
    }

    let mut targets = vec![path.to_path_buf()];
    targets.extend(SIDECAR_SUFFIXES.iter().map(|suffix| sidecar(path, suffix)));

    for target in targets {
        if !files.exists(&target) {
            continue;
        }
        match files.remove(&target) {
            Ok(()) => debug!(path = ?target, "removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::from_io(e, target)),
        }
    }
    Ok(())
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_removes_main_file_and_sidecars() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("app.db");
        fs::write(&db, b"db").unwrap();
        fs::write(dir.path().join("app.db-wal"), b"wal").unwrap();
        fs::write(dir.path().join("app.db-journal"), b"journal").unwrap();
        fs::write(dir.path().join("other.db"), b"keep").unwrap();

        remove_database(&LocalFiles, &db).unwrap();

        assert!(!db.exists());
        assert!(!dir.path().join("app.db-wal").exists());
        assert!(!dir.path().join("app.db-journal").exists());
        assert!(dir.path().join("other.db").exists());
    }

    #[test]
    fn test_missing_database_is_ok() {
        let dir = TempDir::new().unwrap();
        remove_database(&LocalFiles, &dir.path().join("absent.db")).unwrap();
    }

    #[test]
    fn test_removes_directory_recursively() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store.db");
        fs::create_dir_all(store.join("inner")).unwrap();
        fs::write(store.join("inner/file"), b"x").unwrap();

        remove_database(&LocalFiles, &store).unwrap();
        assert!(!store.exists());
    }

    struct Failing {
        attempts: Mutex<Vec<PathBuf>>,
    }

    impl FileRemover for Failing {
        fn exists(&self, _path: &Path) -> bool {
            true
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            self.attempts.lock().unwrap().push(path.to_path_buf());
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }

        fn remove_recursive(&self, path: &Path) -> io::Result<()> {
            self.remove(path)
        }
    }

    #[test]
    fn test_removal_failure_is_reported() {
        let remover = Failing {
            attempts: Mutex::new(Vec::new()),
        };
        let err = remove_database(&remover, Path::new("/nowhere/app.db")).unwrap_err();

        assert!(matches!(err, StorageError::Io { .. }));
        assert_eq!(remover.attempts.lock().unwrap().len(), 1);
    }
}
