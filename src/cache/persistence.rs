//! Persistence Module
//!
//! Durable key/value backends behind the cache store. Every operation is total:
//! backend failures are logged and treated as a missing record.
//!
//! # Layout
//! For tenant `T` and kind `K`:
//! - `cache:{T}:{K}` - serialized items
//! - `cache:{T}:{K}:expiry` - expiry as epoch millis
//! - `cache:{T}:{K}:version` - schema tag

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::warn;

use crate::kind::{CollectionKind, TenantId};

// == Keys ==
pub fn items_key(tenant: &TenantId, kind: CollectionKind) -> String {
    format!("cache:{}:{}", tenant, kind)
}

pub fn expiry_key(tenant: &TenantId, kind: CollectionKind) -> String {
    format!("cache:{}:{}:expiry", tenant, kind)
}

pub fn version_key(tenant: &TenantId, kind: CollectionKind) -> String {
    format!("cache:{}:{}:version", tenant, kind)
}

// == Persistence Trait ==
/// Pluggable string record store.
pub trait Persistence: Send + Sync + Debug {
    fn read(&self, key: &str) -> Option<String>;

    fn write(&self, key: &str, value: &str);

    fn remove(&self, key: &str);
}

// == Memory ==
/// Process-local backend. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: RwLock<HashMap<String, String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for MemoryPersistence {
    fn read(&self, key: &str) -> Option<String> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn write(&self, key: &str, value: &str) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

// == File ==
/// One file per record under a directory.
#[derive(Debug)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Creates the backend, creating `dir` if needed.
    pub fn new(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_file_name(key))
    }
}

impl Persistence for FilePersistence {
    fn read(&self, key: &str) -> Option<String> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Some(value),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                warn!("Failed to read cache record {}: {}", key, err);
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let result = fs::write(&tmp, value).and_then(|_| fs::rename(&tmp, &path));
        if let Err(err) = result {
            warn!("Failed to write cache record {}: {}", key, err);
        }
    }

    fn remove(&self, key: &str) {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove cache record {}: {}", key, err),
        }
    }
}

/// Percent-encodes everything outside `[A-Za-z0-9_-]` so keys map to safe,
/// distinct file names.
fn encode_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name
}

// == No-op ==
/// Stores nothing. Every read misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

impl Persistence for NoopPersistence {
    fn read(&self, _key: &str) -> Option<String> {
        None
    }

    fn write(&self, _key: &str, _value: &str) {}

    fn remove(&self, _key: &str) {}
}
