/// In-memory object store used by the orchestrator tests.
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{ObjectStore, StoreFactory};
use crate::config::RepositoryConfig;
use crate::error::{EngineError, Result};

#[derive(Default)]
pub struct MemoryStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// When set, every write fails; simulates bad credentials/connectivity.
    fail_puts: AtomicBool,
}

impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            ..Self::default()
        }
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> Result<()> {
        Ok(())
    }

    async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("write rejected".to_string()));
        }
        self.insert(key, data);
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key))
    }

    async fn object_size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.get(key).map(|data| data.len() as u64))
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        let mut prefixes = BTreeSet::new();
        for key in objects.keys() {
            if let Some(rest) = key.strip_prefix(prefix) {
                if let Some(slash) = rest.find('/') {
                    prefixes.insert(format!("{prefix}{}/", &rest[..slash]));
                }
            }
        }
        Ok(prefixes.into_iter().collect())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let objects = self.objects.lock().unwrap();
        let mut out = Vec::new();
        for (key, data) in objects.iter() {
            if let Some(rest) = key.strip_prefix(prefix) {
                // Delimiter semantics: only objects immediately under the prefix.
                if !rest.is_empty() && !rest.contains('/') {
                    out.push((key.clone(), data.len() as u64));
                }
            }
        }
        Ok(out)
    }

    async fn upload_file(&self, path: &Path, key: &str, _label: &str) -> Result<()> {
        let data = std::fs::read(path)?;
        self.put_bytes(key, &data).await
    }

    async fn download_file(&self, key: &str, dest: &Path, _label: &str) -> Result<u64> {
        let Some(data) = self.get(key) else {
            return Err(EngineError::ObjectMissing {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            });
        };
        std::fs::write(dest, &data)?;
        Ok(data.len() as u64)
    }
}

/// Factory handing out one shared store, so tests can inspect what the
/// orchestrators wrote.
pub struct MemoryStoreFactory(pub Arc<MemoryStore>);

impl StoreFactory for MemoryStoreFactory {
    fn build(&self, _config: &RepositoryConfig) -> Result<Arc<dyn ObjectStore>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_listing() {
        let store = MemoryStore::new("test-bucket");
        store.put_bytes("backup/a/one.txt", b"1").await.unwrap();
        store.put_bytes("backup/b/two.txt", b"22").await.unwrap();
        store.put_bytes("backup/flat.txt", b"333").await.unwrap();

        assert_eq!(
            store.get_bytes("backup/a/one.txt").await.unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(store.get_bytes("backup/missing").await.unwrap(), None);
        assert_eq!(store.object_size("backup/flat.txt").await.unwrap(), Some(3));

        let prefixes = store.list_prefixes("backup/").await.unwrap();
        assert_eq!(prefixes, vec!["backup/a/", "backup/b/"]);

        let objects = store.list_objects("backup/").await.unwrap();
        assert_eq!(objects, vec![("backup/flat.txt".to_string(), 3)]);
    }

    #[tokio::test]
    async fn test_fail_puts() {
        let store = MemoryStore::new("test-bucket");
        store.fail_puts(true);
        assert!(store.put_bytes("k", b"v").await.is_err());
        store.fail_puts(false);
        assert!(store.put_bytes("k", b"v").await.is_ok());
    }
}
