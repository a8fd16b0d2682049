//! On-disk file storage.
//!
//! Provides the storage capability consumed by the dispatcher:
//! - list, get, upload and delete of files in a single directory
//! - rejection of names that could escape the storage root
//!
//! Concurrent uploads to the same name are not serialized; the last writer
//! wins.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Storage errors
#[derive(Debug)]
pub enum StorageError {
    /// Name is empty, absolute, or contains a path separator or `..`
    InvalidName(String),
    /// No file with this name
    NotFound(String),
    /// Underlying file system failure
    Io(io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidName(name) => write!(f, "Invalid filename '{}'", name),
            StorageError::NotFound(name) => write!(f, "File '{}' not found", name),
            StorageError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// File storage capability.
pub trait FileStorage: Send + Sync {
    /// Names of all stored files, sorted
    fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Full contents of a stored file
    fn get(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Create or overwrite a file
    fn upload(&self, name: &str, contents: &[u8]) -> Result<(), StorageError>;

    /// Remove a file
    fn delete(&self, name: &str) -> Result<(), StorageError>;

    /// Where files are kept, for messages
    fn location(&self) -> String;
}

/// Storage backed by a single directory
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    /// Open a storage root, creating the directory if needed
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            fs::create_dir_all(root)?;
            info!(root = %root.display(), "Created storage directory");
        }
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// Resolve a client-supplied name to a path inside the root.
    fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_name(name) {
            debug!(name, "Rejected file name");
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

/// A valid name is a single normal path component.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.contains('\0') || name.contains("..") {
        return false;
    }
    if name.contains('/') || name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn not_found_or(e: io::Error, name: &str) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        StorageError::Io(e)
    }
}

impl FileStorage for DirStorage {
    fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn get(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(name)?;
        fs::read(&path).map_err(|e| not_found_or(e, name))
    }

    fn upload(&self, name: &str, contents: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(name)?;
        fs::write(&path, contents)?;
        debug!(name, bytes = contents.len(), "Stored file");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.resolve(name)?;
        fs::remove_file(&path).map_err(|e| not_found_or(e, name))
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, DirStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirStorage::open(dir.path().join("files")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_open_creates_root() {
        let (dir, storage) = storage();
        assert!(dir.path().join("files").is_dir());
        assert!(storage.list().unwrap().is_empty());
    }

    #[test]
    fn test_upload_get_roundtrip() {
        let (_dir, storage) = storage();
        let contents: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        storage.upload("blob.bin", &contents).unwrap();
        assert_eq!(storage.get("blob.bin").unwrap(), contents);
    }

    #[test]
    fn test_list_after_upload_and_delete() {
        let (_dir, storage) = storage();

        storage.upload("b.txt", b"b").unwrap();
        storage.upload("a.txt", b"a").unwrap();
        assert_eq!(storage.list().unwrap(), vec!["a.txt", "b.txt"]);

        storage.delete("a.txt").unwrap();
        assert_eq!(storage.list().unwrap(), vec!["b.txt"]);
    }

    #[test]
    fn test_list_skips_directories() {
        let (dir, storage) = storage();
        fs::create_dir(dir.path().join("files").join("nested")).unwrap();
        storage.upload("file", b"x").unwrap();
        assert_eq!(storage.list().unwrap(), vec!["file"]);
    }

    #[test]
    fn test_upload_overwrites() {
        let (_dir, storage) = storage();
        storage.upload("a.txt", b"first").unwrap();
        storage.upload("a.txt", b"second").unwrap();
        assert_eq!(storage.get("a.txt").unwrap(), b"second");
    }

    #[test]
    fn test_missing_file() {
        let (_dir, storage) = storage();
        assert!(matches!(storage.get("nope"), Err(StorageError::NotFound(_))));
        assert!(matches!(storage.delete("nope"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirStorage::open(dir.path().join("files")).unwrap();
        fs::write(dir.path().join("secret.txt"), b"secret").unwrap();

        for name in ["../secret.txt", "/etc/passwd", "..", "a/../../secret.txt", "sub/x", ""] {
            assert!(
                matches!(storage.get(name), Err(StorageError::InvalidName(_))),
                "get accepted {name:?}"
            );
            assert!(
                matches!(storage.upload(name, b"x"), Err(StorageError::InvalidName(_))),
                "upload accepted {name:?}"
            );
            assert!(
                matches!(storage.delete(name), Err(StorageError::InvalidName(_))),
                "delete accepted {name:?}"
            );
        }

        // Nothing outside the root was touched
        assert_eq!(fs::read(dir.path().join("secret.txt")).unwrap(), b"secret");
        assert!(storage.list().unwrap().is_empty());
    }
}
