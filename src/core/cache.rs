//! Minimal key/value cache used by adapters that persist flags.
//!
//! A cache never fails loudly: `set` reports success as a boolean so that a
//! full disk or unavailable storage degrades to stale flags instead of
//! breaking flag delivery.

use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ErrorCode, FlagBridgeError};
use crate::types::Flags;

/// Prefix applied to every key unless configured otherwise.
pub const DEFAULT_CACHE_PREFIX: &str = "@flopflip";

/// Logical storage scope of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheIdentifier {
    /// Survives the process (file backed).
    Local,
    /// Lives as long as the process (memory backed).
    Session,
}

impl CacheIdentifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheIdentifier::Local => "local",
            CacheIdentifier::Session => "session",
        }
    }
}

impl fmt::Display for CacheIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub prefix: String,
    /// Directory used by local caches. Defaults to a `flagbridge` folder in
    /// the system temp directory.
    pub directory: Option<PathBuf>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_CACHE_PREFIX.to_string(),
            directory: None,
        }
    }
}

impl CacheOptions {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            directory: None,
        }
    }

    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }
}

/// Key/value storage contract.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<serde_json::Value>;

    /// Stores `value`, returning `false` when it could not be persisted.
    fn set(&self, key: &str, value: serde_json::Value) -> bool;

    fn unset(&self, key: &str);
}

/// Builds the logical key for a flag set: `<scope>/<name>`. The cache adds
/// its own prefix on top.
pub fn cache_key(identifier: CacheIdentifier, name: &str) -> String {
    format!("{}/{}", identifier, name)
}

/// Creates the default cache backing `identifier`.
pub fn create_cache(identifier: CacheIdentifier, options: CacheOptions) -> Arc<dyn Cache> {
    match identifier {
        CacheIdentifier::Session => Arc::new(MemoryCache::new(options.prefix)),
        CacheIdentifier::Local => {
            let directory = options
                .directory
                .unwrap_or_else(|| std::env::temp_dir().join("flagbridge"));
            Arc::new(FileCache::new(options.prefix, directory))
        }
    }
}

/// Reads a flag set, ignoring entries that are not a well-formed flags map.
pub fn read_flags(cache: &dyn Cache, key: &str) -> Option<Flags> {
    let value = cache.get(key)?;
    match serde_json::from_value::<Flags>(value) {
        Ok(flags) => Some(flags),
        Err(e) => {
            let error = FlagBridgeError::with_source(
                ErrorCode::CacheInvalidData,
                format!("Ignoring malformed cached flags under '{}'", key),
                e,
            );
            tracing::warn!("{}", error);
            None
        }
    }
}

/// Writes a flag set, logging instead of failing when persistence is not
/// possible.
pub fn write_flags(cache: &dyn Cache, key: &str, flags: &Flags) -> bool {
    let persisted = match serde_json::to_value(flags) {
        Ok(value) => cache.set(key, value),
        Err(e) => {
            tracing::warn!("Failed to serialize flags for '{}': {}", key, e);
            false
        }
    };

    if !persisted {
        tracing::warn!("{}", FlagBridgeError::cache_persist(key));
    }

    persisted
}

/// Process-local cache.
pub struct MemoryCache {
    prefix: String,
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryCache {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_PREFIX)
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().get(&self.prefixed(key)).cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) -> bool {
        self.entries.write().insert(self.prefixed(key), value);
        true
    }

    fn unset(&self, key: &str) {
        self.entries.write().remove(&self.prefixed(key));
    }
}

/// Cache persisting each key as a JSON file.
///
/// Writes go through a temporary file and a rename while holding an
/// exclusive lock on `.lock`, so concurrent writers to one key end up with
/// the last complete write.
pub struct FileCache {
    prefix: String,
    directory: PathBuf,
}

impl FileCache {
    pub fn new(prefix: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// One file per key. Bytes other than ASCII alphanumerics and `-` are
    /// written as `_XX`, so distinct keys never share a file.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut file_name = String::new();
        for byte in format!("{}/{}", self.prefix, key).bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file_name.push(char::from(byte));
            } else {
                file_name.push_str(&format!("_{:02X}", byte));
            }
        }
        self.directory.join(format!("{}.json", file_name))
    }

    fn lock_file(&self) -> std::io::Result<File> {
        fs::create_dir_all(&self.directory)?;
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.directory.join(".lock"))?;
        lock.lock_exclusive()?;
        Ok(lock)
    }

    fn try_set(&self, key: &str, value: &serde_json::Value) -> std::io::Result<()> {
        let lock = self.lock_file()?;

        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path)?;
            serde_json::to_writer(&mut file, value)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;

        lock.unlock()?;
        Ok(())
    }
}

impl Cache for FileCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let path = self.path_for(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read cache file {:?}: {}", path, e);
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Cache file {:?} is not valid JSON: {}", path, e);
                None
            }
        }
    }

    fn set(&self, key: &str, value: serde_json::Value) -> bool {
        match self.try_set(key, &value) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to write cache key '{}': {}", key, e);
                false
            }
        }
    }

    fn unset(&self, key: &str) {
        let path = self.path_for(key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove cache file {:?}: {}", path, e);
            }
        }
    }
}
