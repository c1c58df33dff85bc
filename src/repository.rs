/// Repository gate-keeper.
///
/// Two advisory checks run before any mutating operation: the
/// storage-integration settings must be complete, and the repository must
/// not already belong to another cluster. A repository is claimed by the
/// first cluster that writes the marker object at its root; from then on
/// only that cluster may write to it.
use tracing::{debug, info};

use crate::cluster::StorageIntegration;
use crate::config::RepositoryConfig;
use crate::error::{EngineError, Result};
use crate::storage::ObjectStore;

pub const MODEL_UUID_FILENAME: &str = "model-uuid.txt";

pub const FAILED_TO_ACCESS_CREATE_BUCKET_ERROR_MESSAGE: &str =
    "failed to access/create the bucket, check your S3 settings";

/// Blocking conditions owned by this engine, cleared when the storage
/// relation goes away.
pub const S3_BLOCK_MESSAGES: [&str; 1] = [FAILED_TO_ACCESS_CREATE_BUCKET_ERROR_MESSAGE];

/// Validate that the storage-integration relation exists and carries the
/// required parameters, returning the parsed configuration.
pub fn settings_ok(relation: &dyn StorageIntegration) -> Result<RepositoryConfig> {
    let Some(info) = relation.connection_info() else {
        return Err(EngineError::RelationMissing);
    };
    RepositoryConfig::from_connection_info(&info)
}

/// Check whether this cluster may use the repository. A marker written by a
/// different cluster fails the check; an absent marker means first use.
pub async fn check_compatible(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    cluster_uuid: &str,
) -> Result<()> {
    let key = config.object_key(MODEL_UUID_FILENAME);
    if let Some(bytes) = store.get_bytes(&key).await? {
        let marker = String::from_utf8_lossy(&bytes);
        let marker = marker.trim();
        if !marker.is_empty() && marker != cluster_uuid {
            debug!(
                s3 = marker,
                local = cluster_uuid,
                "incompatible repository marker"
            );
            return Err(EngineError::ForeignRepository);
        }
    }
    Ok(())
}

/// Record this cluster as the repository owner. First writer wins; callers
/// run [`check_compatible`] beforehand.
pub async fn claim(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    cluster_uuid: &str,
) -> Result<()> {
    let key = config.object_key(MODEL_UUID_FILENAME);
    info!(bucket = store.bucket(), key = %key, "writing repository marker");
    store.put_bytes(&key, cluster_uuid.as_bytes()).await
}
