//! An in-memory [`ObjectStore`] for tests.
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use snafu::ResultExt;

use super::{ObjectInfo, ObjectStore, RequestSnafu, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// `(operation, key)`, no operation means every operation.
    failing: BTreeSet<(Option<&'static str>, String)>,
}

impl MemoryStore {
    /// Objects whose content is their own key.
    pub fn with_objects<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        Self::with_contents(keys.into_iter().map(|key| (key, key.as_bytes())))
    }

    pub fn with_contents<'a>(objects: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        Self {
            objects: Mutex::new(
                objects
                    .into_iter()
                    .map(|(key, content)| (key.to_string(), content.to_vec()))
                    .collect(),
            ),
            failing: BTreeSet::new(),
        }
    }

    /// Every request touching `key` fails from now on.
    pub fn failing_on(mut self, key: &str) -> Self {
        self.failing.insert((None, key.to_string()));
        self
    }

    /// Only `operation` on `key` fails from now on.
    pub fn failing_operation(mut self, operation: &'static str, key: &str) -> Self {
        self.failing.insert((Some(operation), key.to_string()));
        self
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn check(&self, operation: &'static str, key: &str) -> Result<()> {
        let key = key.to_string();
        if self.failing.contains(&(None, key.clone()))
            || self.failing.contains(&(Some(operation), key.clone()))
        {
            return Err(std::io::Error::other("connection reset"))
                .boxed()
                .context(RequestSnafu { operation, key });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, _path: &Path, size: u64) -> Result<()> {
        self.check("upload", key)?;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), vec![0; size as usize]);
        Ok(())
    }

    async fn get(&self, key: &str, path: &Path) -> Result<u64> {
        self.check("download", key)?;
        let content = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
            .boxed()
            .context(RequestSnafu {
                operation: "download",
                key,
            })?;
        tokio::fs::write(path, &content)
            .await
            .boxed()
            .context(RequestSnafu {
                operation: "write",
                key,
            })?;
        Ok(content.len() as u64)
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>> {
        self.check("stat", key)?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|content| ObjectInfo {
                size: Some(content.len() as u64),
            }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check("delete", key)?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn presigned_url(&self, key: &str, expiry: Duration) -> Result<String> {
        self.check("presign", key)?;
        Ok(format!(
            "https://objects.example.com/{key}?expires={}",
            expiry.as_secs()
        ))
    }
}
