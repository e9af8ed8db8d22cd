//! Key-value storage the cache and credential store sit on.
//!
//! Keys are single path segments (`instagram_cookies.txt`, `<hash>.json`).
//! The filesystem backend maps each key to one file under its root; the
//! memory backend exists for tests and for running without a data directory.
//! Neither backend locks: concurrent writers to one key are last-writer-wins.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;

pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> io::Result<()>;

    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> io::Result<bool>;

    fn keys(&self) -> io::Result<Vec<String>>;

    /// Removes every key, returning how many were removed.
    fn clear(&self) -> io::Result<usize>;

    fn exists(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }

    /// Location of the key on the local filesystem, for collaborators (the
    /// extractor's `--cookies` flag) that need a real path.
    fn local_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }
}

fn ensure_valid_key(key: &str) -> io::Result<()> {
    let mut components = Path::new(key).components();
    let valid = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !key.ends_with(".tmp");
    if valid {
        Ok(())
    } else {
        Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid storage key: {key:?}"),
        ))
    }
}

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        ensure_valid_key(key)?;
        Ok(self.root.join(key))
    }
}

impl Storage for FsStorage {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.root)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, value)?;
        fs::rename(&tmp_path, &path)
    }

    fn delete(&self, key: &str) -> io::Result<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".tmp") {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> io::Result<usize> {
        let mut removed = 0;
        for key in self.keys()? {
            if self.delete(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn exists(&self, key: &str) -> bool {
        self.path_for(key).map(|path| path.is_file()).unwrap_or(false)
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.path_for(key).ok()
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        ensure_valid_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        ensure_valid_key(key)?;
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> io::Result<bool> {
        ensure_valid_key(key)?;
        Ok(self.entries.write().remove(key).is_some())
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn clear(&self) -> io::Result<usize> {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }
}
