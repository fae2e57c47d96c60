use std::io;
use std::path::{Component, Path, PathBuf};

/// File store holding the bytes behind [`DocumentRecord`](super::domain::DocumentRecord)s.
/// The admissions core only ever removes files by storage key.
pub trait DocumentStorage: Send + Sync {
    /// Removes the stored file. Removing a key that does not exist succeeds.
    fn remove(&self, storage_key: &str) -> Result<(), DocumentStorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentStorageError {
    #[error("storage key '{0}' is not a relative path inside the document root")]
    InvalidKey(String),
    #[error("failed to remove document '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

/// Documents kept on the local filesystem under a single root directory.
#[derive(Debug, Clone)]
pub struct LocalDocumentStorage {
    root: PathBuf,
}

impl LocalDocumentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, storage_key: &str) -> Result<PathBuf, DocumentStorageError> {
        if is_confined_key(storage_key) {
            Ok(self.root.join(storage_key))
        } else {
            Err(DocumentStorageError::InvalidKey(storage_key.to_string()))
        }
    }
}

/// A storage key must be a non-empty relative path made only of normal components.
pub fn is_confined_key(storage_key: &str) -> bool {
    !storage_key.is_empty()
        && Path::new(storage_key)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

impl DocumentStorage for LocalDocumentStorage {
    fn remove(&self, storage_key: &str) -> Result<(), DocumentStorageError> {
        let path = self.resolve(storage_key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DocumentStorageError::Io {
                key: storage_key.to_string(),
                source,
            }),
        }
    }
}
