use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Small persistent key/value store.
///
/// Holds the little state the engine keeps across restarts: per-task daily
/// run-time counters, last-known priorities for warm-up and the thermal
/// model node tables. Backed by a single JSON file rewritten atomically on
/// every mutation; contention is negligible at one write per minute.
pub struct Store {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt store file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("cannot read {}", path.display()))
            }
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.lock().unwrap();
        data.get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.insert(key.to_string(), serde_json::to_value(value)?);
        self.flush(&data)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.remove(key).is_some() {
            self.flush(&data)?;
        }
        Ok(())
    }

    fn flush(&self, data: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(data)?)
            .with_context(|| format!("cannot write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("cannot replace {}", self.path.display()))?;
        Ok(())
    }
}
