/// Backup orchestrator.
///
/// A linear state machine with early-exit failure branches:
/// 1. Credential probe: write a small marker object before any expensive
///    archiving work, so bad credentials fail fast.
/// 2. Allocate the backup identity (the UTC timestamp).
/// 3. Enumerate controller system ids; a backup whose controller list cannot
///    be determined is not trustworthy for restore, so this is fatal.
/// 4. Upload the controller list, then the image archive, then the preseed
///    archive, strictly in that order on one task.
/// 5. Finalize the metadata object with `success` reflecting the outcome of
///    step 4, whatever it was: even a failed backup leaves a discoverable,
///    explicitly-failed record rather than a silent partial upload.
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{error, info};

use crate::catalog::{
    BackupMetadata, CONTROLLER_LIST_FILENAME, IMAGE_TAR_FILENAME, METADATA_FILENAME,
    PRESEED_TAR_FILENAME,
};
use crate::cluster::{ClusterContext, LocalPaths};
use crate::config::RepositoryConfig;
use crate::error::{EngineError, Result};
use crate::archive;
use crate::storage::ObjectStore;

pub const BACKUP_ID_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Key of the liveness probe object, relative to the configured path.
pub const LATEST_MARKER_PATH: &str = "backup/latest";

/// A backup identity is the UTC second at which the backup was initiated;
/// the format sorts lexicographically by creation time.
pub fn generate_backup_id(now: DateTime<Utc>) -> String {
    now.format(BACKUP_ID_FORMAT).to_string()
}

/// Run a full backup against an already-validated repository. Returns the
/// new backup's identity.
pub async fn create_backup(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    cluster: &dyn ClusterContext,
    paths: &LocalPaths,
) -> Result<String> {
    let requested_at = generate_backup_id(Utc::now());
    let probe = format!(
        "Date Backup Requested: {requested_at}\n\
         Cluster UUID: {}\n\
         Unit Name: {}\n\
         Juju Version: {}\n",
        cluster.cluster_uuid(),
        cluster.unit_name(),
        cluster.juju_version(),
    );
    info!("uploading metadata to s3");
    if let Err(e) = store
        .put_bytes(&config.object_key(LATEST_MARKER_PATH), probe.as_bytes())
        .await
    {
        error!(error = %e, "failed to upload metadata to s3");
        return Err(EngineError::Operation(
            "Failed to upload metadata to provided S3.".to_string(),
        ));
    }

    let backup_id = generate_backup_id(Utc::now());
    let backup_path = format!("backup/{backup_id}");
    info!(backup_id = %backup_id, "creating backup");

    let outcome = execute_backup(store, config, cluster, paths, &backup_path).await;

    // The durability anchor: finalize the metadata record whatever happened.
    info!("uploading backup metadata to s3");
    let metadata = BackupMetadata {
        success: outcome.is_ok(),
        maas_version: cluster.installed_version().unwrap_or_default(),
        maas_snap_channel: cluster.installed_channel().unwrap_or_default(),
        unit_name: cluster.unit_name(),
        juju_version: cluster.juju_version(),
    };
    let body =
        serde_json::to_vec(&metadata).map_err(|e| EngineError::Serialization(e.to_string()))?;
    if let Err(e) = store
        .put_bytes(
            &config.object_key(&format!("{backup_path}/{METADATA_FILENAME}")),
            &body,
        )
        .await
    {
        error!(error = %e, backup_id = %backup_id, "failed to upload backup metadata");
        return Err(EngineError::Operation(format!(
            "Failed to upload backup metadata to S3 for backup-id {backup_id}."
        )));
    }

    match outcome {
        Ok(()) => {
            info!(backup_id = %backup_id, "backup succeeded");
            Ok(backup_id)
        }
        Err(EngineError::RegionsNotAvailable) => Err(EngineError::RegionsNotAvailable),
        Err(e) => {
            error!(error = %e, "failed to archive and upload MAAS files to s3");
            Err(EngineError::Operation(
                "Failed to archive and upload MAAS files to S3.".to_string(),
            ))
        }
    }
}

async fn execute_backup(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    cluster: &dyn ClusterContext,
    paths: &LocalPaths,
    backup_path: &str,
) -> Result<()> {
    info!("retrieving region ids from MAAS");
    // The enumeration call carries the admin API key; the cause stays out of
    // the log.
    let controllers = cluster
        .controller_system_ids()
        .await
        .map_err(|_| EngineError::RegionsNotAvailable)?;

    info!("uploading region ids to s3");
    let list: Vec<String> = controllers.into_iter().collect();
    let mut controllers_file = NamedTempFile::new()?;
    controllers_file.write_all(list.join("\n").as_bytes())?;
    controllers_file.flush()?;
    store
        .upload_file(
            controllers_file.path(),
            &config.object_key(&format!("{backup_path}/{CONTROLLER_LIST_FILENAME}")),
            "region ids",
        )
        .await?;

    upload_dir_archive(
        store,
        config,
        &paths.image_storage,
        backup_path,
        IMAGE_TAR_FILENAME,
        "image archive",
    )
    .await?;

    upload_dir_archive(
        store,
        config,
        &paths.preseeds,
        backup_path,
        PRESEED_TAR_FILENAME,
        "preseed archive",
    )
    .await?;

    Ok(())
}

async fn upload_dir_archive(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    src: &Path,
    backup_path: &str,
    filename: &str,
    label: &str,
) -> Result<()> {
    info!(source = %src.display(), "creating {label} for s3 backup");
    let staging = tempfile::Builder::new().suffix(".tar.gz").tempfile()?;
    archive::create_tar_gz(src, staging.path())?;

    info!("uploading {label} to s3");
    store
        .upload_file(
            staging.path(),
            &config.object_key(&format!("{backup_path}/{filename}")),
            label,
        )
        .await
}
