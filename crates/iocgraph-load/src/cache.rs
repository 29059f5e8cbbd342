//! On-disk result cache keyed by deterministic content hashes.
//!
//! A cache entry's filename is a fixed one-way digest of
//! `(class name, format version, sorted field pairs)`; callers treat the
//! filename as opaque and never parse it. Two workers computing the same key
//! write identical bytes, so the write lock is only about avoiding redundant
//! work, not correctness.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Bump when the serialized payload shape changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// A deterministic cache key: class name, format version and the sorted
/// `name=value` pairs identifying the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    class: &'static str,
    version: u32,
    fields: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(class: &'static str, version: u32) -> Self {
        Self {
            class,
            version,
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// The opaque entry filename.
    pub fn filename(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.class.as_bytes());
        hasher.update(b"|");
        hasher.update(self.version.to_string().as_bytes());
        for (name, value) in &self.fields {
            hasher.update(b"|");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(69);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        out.push_str(".json");
        out
    }
}

/// A best-effort JSON cache rooted at one directory.
pub struct Cache {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl Cache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn load<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let path = self.dir.join(key.filename());
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), "discarding unreadable cache entry: {e}");
                None
            }
        }
    }

    pub fn store<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        let _guard = self.write_lock.lock();
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache dir {}", self.dir.display()))?;
        let path = self.dir.join(key.filename());
        let text = serde_json::to_string(value).context("serializing cache entry")?;
        std::fs::write(&path, text)
            .with_context(|| format!("writing cache entry {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_deterministic_and_field_order_insensitive() {
        let a = CacheKey::new("IocLoadResult", 1)
            .field("name", "ioc-a")
            .field("script", "/x/st.cmd");
        let b = CacheKey::new("IocLoadResult", 1)
            .field("script", "/x/st.cmd")
            .field("name", "ioc-a");
        assert_eq!(a.filename(), b.filename());
        assert!(a.filename().ends_with(".json"));
    }

    #[test]
    fn filenames_separate_class_version_and_fields() {
        let base = CacheKey::new("IocLoadResult", 1).field("name", "ioc-a");
        assert_ne!(
            base.filename(),
            CacheKey::new("IocLoadResult", 2)
                .field("name", "ioc-a")
                .filename()
        );
        assert_ne!(
            base.filename(),
            CacheKey::new("Other", 1).field("name", "ioc-a").filename()
        );
        assert_ne!(
            base.filename(),
            CacheKey::new("IocLoadResult", 1)
                .field("name", "ioc-b")
                .filename()
        );
    }

    #[test]
    fn round_trips_values_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Cache::new(dir.path());
        let key = CacheKey::new("Test", 1).field("k", "v");
        assert_eq!(cache.load::<Vec<String>>(&key), None);
        cache
            .store(&key, &vec!["one".to_string(), "two".to_string()])
            .expect("store");
        assert_eq!(
            cache.load::<Vec<String>>(&key),
            Some(vec!["one".to_string(), "two".to_string()])
        );
    }
}
