/// Object-store abstraction for the backup repository.
///
/// The orchestrators speak to the repository through the `ObjectStore`
/// trait; the S3 backend is the production implementation and an in-memory
/// backend backs the tests. Keys passed here are bucket-relative, already
/// joined onto the configured path prefix.
pub mod s3;

#[cfg(test)]
pub mod memory;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RepositoryConfig;
use crate::error::Result;

/// One backup repository bound to a concrete bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket this store operates on, for diagnostics.
    fn bucket(&self) -> &str;

    /// Make sure the bucket exists, creating it if necessary.
    async fn ensure_bucket(&self) -> Result<()>;

    /// Write a small object in full.
    async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read a small object in full. `None` if the object does not exist.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Size of an object in bytes. `None` if the object does not exist.
    async fn object_size(&self, key: &str) -> Result<Option<u64>>;

    /// Immediate child prefixes under `prefix` (a delimiter listing, not a
    /// recursive walk). Returned values are full prefixes ending in `/`.
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>>;

    /// Immediate objects under `prefix` with their sizes.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<(String, u64)>>;

    /// Upload a local file, reporting byte-level progress under `label`.
    async fn upload_file(&self, path: &Path, key: &str, label: &str) -> Result<()>;

    /// Download an object to a local file, reporting byte-level progress
    /// under `label`. Returns the number of bytes written.
    async fn download_file(&self, key: &str, dest: &Path, label: &str) -> Result<u64>;
}

/// Builds a store for a repository configuration. One store is built per
/// operation; nothing is cached between calls.
pub trait StoreFactory: Send + Sync {
    fn build(&self, config: &RepositoryConfig) -> Result<Arc<dyn ObjectStore>>;
}
