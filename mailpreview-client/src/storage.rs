use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Namespace every key is stored under.
pub const STORAGE_PREFIX: &str = "cssinliner";

/// The store holds two small preferences; anything bigger is corruption.
pub const MAX_STORE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

pub fn storage_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("MAILPREVIEW_STORAGE_DIR") {
        return PathBuf::from(override_dir);
    }

    let base = std::env::var_os("LOCALAPPDATA")
        .or_else(|| std::env::var_os("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("MailPreview")
}

/// Durable client-local key/value storage: one JSON object on disk whose keys
/// are `<prefix>.<key>`. Every write goes straight through to the file.
#[derive(Debug)]
pub struct LocalStore {
    path: PathBuf,
    prefix: String,
    values: BTreeMap<String, Value>,
}

impl LocalStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_prefix(path, STORAGE_PREFIX)
    }

    pub fn open_with_prefix(path: impl Into<PathBuf>, prefix: &str) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match load_values(&path) {
            Ok(values) => values,
            Err(StoreError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => {
                BTreeMap::new()
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            prefix: prefix.to_owned(),
            values,
        })
    }

    /// Opens the store, falling back to an empty in-memory view when the file
    /// is unreadable. The broken file is left alone until the next save.
    pub fn open_or_empty(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::open(path.clone()) {
            Ok(store) => store,
            Err(err) => {
                warn!(path = %path.display(), "ignoring unreadable local store: {err}");
                Self {
                    path,
                    prefix: STORAGE_PREFIX.to_owned(),
                    values: BTreeMap::new(),
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(&self.key(key))?;
        match serde_json::from_value::<T>(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key, "stored value has unexpected shape: {err}");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(StoreError::Serialize)?;
        self.set_all([(key, value)])
    }

    /// Writes every entry with a single flush. When the flush fails nothing
    /// changes, in memory or on disk.
    pub fn set_all<'k>(
        &mut self,
        entries: impl IntoIterator<Item = (&'k str, Value)>,
    ) -> Result<(), StoreError> {
        let previous = self.values.clone();
        for (key, value) in entries {
            self.values.insert(self.key(key), value);
        }
        if let Err(err) = self.flush() {
            self.values = previous;
            return Err(err);
        }
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        format!("{}.{}", self.prefix, key)
    }

    fn flush(&self) -> Result<(), StoreError> {
        const MAX_ATTEMPTS: u32 = 3;
        const BACKOFF_BASE_MS: u64 = 50;

        let mut attempt: u32 = 1;
        loop {
            match save_values(&self.path, &self.values) {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
                Err(err) => {
                    warn!(attempt, path = %self.path.display(), "local store write failed: {err}");
                    let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    attempt += 1;
                }
            }
        }
    }
}

fn load_values(path: &Path) -> Result<BTreeMap<String, Value>, StoreError> {
    let meta = fs::metadata(path).map_err(StoreError::Metadata)?;
    if meta.len() > MAX_STORE_BYTES {
        return Err(StoreError::TooLarge {
            size: meta.len(),
            max: MAX_STORE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(StoreError::Read)?;
    serde_json::from_str::<BTreeMap<String, Value>>(&data).map_err(StoreError::Parse)
}

fn save_values(path: &Path, values: &BTreeMap<String, Value>) -> Result<(), StoreError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(StoreError::WriteTmp)?;
    }

    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(values).map_err(StoreError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(StoreError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(StoreError::Rename)?;
    Ok(())
}
