/// Restore orchestrator.
///
/// Restores run on the node they target and are not leader-gated: during a
/// cluster-wide recovery different nodes restore different controller
/// identities. Each step gates the next; steps already completed are not
/// rolled back. A failed restore leaves the node partially restored and the
/// failure message directs the operator to inspect it.
use std::fs;
use std::io::Write;
use std::path::Path;

use semver::Version;
use tempfile::NamedTempFile;
use tracing::{error, info};

use crate::catalog::{
    self, CONTROLLER_LIST_FILENAME, IMAGE_TAR_FILENAME, METADATA_FILENAME, PRESEED_TAR_FILENAME,
    BackupMetadata,
};
use crate::cluster::{ClusterContext, LocalPaths, StorageIntegration};
use crate::config::RepositoryConfig;
use crate::error::{EngineError, Result};
use crate::storage::ObjectStore;
use crate::{archive, repository};

/// Parameters of one restore invocation.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub backup_id: String,
    pub controller_id: String,
}

/// Checks that must hold before a restore may start. All are side-effect
/// free; any failure means nothing was touched.
pub fn pre_restore_checks(
    relation: &dyn StorageIntegration,
    cluster: &dyn ClusterContext,
    request: &RestoreRequest,
) -> Result<RepositoryConfig> {
    let config = repository::settings_ok(relation)?;

    if request.backup_id.is_empty() {
        return Err(EngineError::MissingActionParameter("backup-id"));
    }
    if request.controller_id.is_empty() {
        return Err(EngineError::MissingActionParameter("controller-id"));
    }

    info!("checking if cluster is in blocked state");
    if cluster.blocked_status().is_some() {
        return Err(EngineError::ClusterBlocked);
    }

    // Restoring filesystem state while the running application still holds
    // its old database connection would leave the two out of step; the
    // relation must be removed first.
    info!("checking that the PostgreSQL relation has been removed");
    if let Some(db_app) = cluster.database_relation() {
        return Err(EngineError::DatabaseRelationActive {
            app: cluster.app_name(),
            db_app,
        });
    }

    Ok(config)
}

/// Run a restore against an already-validated repository.
pub async fn restore_backup(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    cluster: &dyn ClusterContext,
    paths: &LocalPaths,
    request: &RestoreRequest,
) -> Result<()> {
    // An empty id skips catalog validation; only lower-level callers rely
    // on that, the operator-facing command rejects it earlier.
    if !request.backup_id.is_empty() {
        info!("validating provided backup-id");
        let ids = catalog::backup_ids(store, config).await.map_err(|e| {
            error!(error = %e, "failed to retrieve backups list");
            EngineError::Operation("Failed to retrieve backups list".to_string())
        })?;
        if !ids.contains(&request.backup_id) {
            return Err(EngineError::InvalidBackupId(request.backup_id.clone()));
        }
    }

    let backup_path = format!("backup/{}", request.backup_id);

    check_backup_version(store, config, cluster, &backup_path).await?;
    update_controller_id(store, config, cluster, paths, &backup_path, &request.controller_id)
        .await?;

    restore_artifact(
        store,
        config,
        &backup_path,
        PRESEED_TAR_FILENAME,
        &paths.preseeds,
        "preseeds",
    )
    .await?;
    restore_artifact(
        store,
        config,
        &backup_path,
        IMAGE_TAR_FILENAME,
        &paths.image_storage,
        "images",
    )
    .await?;

    info!("restore complete; reconnect the database relation to restart MAAS");
    Ok(())
}

/// Reject restores across incompatible workload versions: major and minor
/// must match, and the installed point release must not be older than the
/// backup's.
async fn check_backup_version(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    cluster: &dyn ClusterContext,
    backup_path: &str,
) -> Result<()> {
    info!("downloading metadata from s3");
    let key = config.object_key(&format!("{backup_path}/{METADATA_FILENAME}"));
    let Some(bytes) = store.get_bytes(&key).await? else {
        return Err(EngineError::VersionMismatch(
            "Could not read metadata from s3".to_string(),
        ));
    };
    let metadata: BackupMetadata =
        serde_json::from_slice(&bytes).map_err(|e| EngineError::Serialization(e.to_string()))?;

    if metadata.maas_version.is_empty() {
        return Err(EngineError::VersionMismatch(
            "Could not locate snap version in backup".to_string(),
        ));
    }
    let Some(installed) = cluster.installed_version().filter(|v| !v.is_empty()) else {
        return Err(EngineError::VersionMismatch(
            "Could not locate snap version on running MAAS instance".to_string(),
        ));
    };

    compare_versions(&installed, &metadata.maas_version)
}

/// `3.6.2` may restore a `3.6.1` backup; `3.6.0` and `3.7.x` may not.
pub(crate) fn compare_versions(installed: &str, backup: &str) -> Result<()> {
    let installed_version = parse_version(installed).ok_or_else(|| {
        EngineError::VersionMismatch(format!(
            "Could not parse installed MAAS version '{installed}'"
        ))
    })?;
    let backup_version = parse_version(backup).ok_or_else(|| {
        EngineError::VersionMismatch(format!("Could not parse backup MAAS version '{backup}'"))
    })?;

    if installed_version.major != backup_version.major {
        return Err(EngineError::VersionMismatch(
            "MAAS major version does not match backup major version".to_string(),
        ));
    }
    if installed_version.minor != backup_version.minor {
        return Err(EngineError::VersionMismatch(
            "MAAS minor version does not match backup minor version".to_string(),
        ));
    }
    if installed_version.patch < backup_version.patch {
        return Err(EngineError::VersionMismatch(
            "MAAS point version is not greater or equal to backup point version".to_string(),
        ));
    }
    Ok(())
}

/// Versions may arrive with a channel suffix (`3.6.1/stable`); only the
/// leading triplet matters.
fn parse_version(version: &str) -> Option<Version> {
    let base = version.split('/').next()?;
    Version::parse(base).ok()
}

/// Reassign this node's controller identity from the backup's controller
/// list. Only meaningful when the cluster topology matches what existed at
/// backup time, so the list's cardinality must equal the live peer count.
async fn update_controller_id(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    cluster: &dyn ClusterContext,
    paths: &LocalPaths,
    backup_path: &str,
    controller_id: &str,
) -> Result<()> {
    info!("downloading controllers list from s3");
    let key = config.object_key(&format!("{backup_path}/{CONTROLLER_LIST_FILENAME}"));
    let Some(bytes) = store.get_bytes(&key).await? else {
        return Err(EngineError::ControllerMismatch(
            "Could not read controllers list from s3".to_string(),
        ));
    };
    let controllers = catalog::parse_controller_list(&bytes);

    let Some(regions) = cluster.peer_count() else {
        return Err(EngineError::ControllerMismatch(
            "Could not fetch MAAS regions list".to_string(),
        ));
    };
    if controllers.len() != regions {
        return Err(EngineError::ControllerMismatch(format!(
            "The number of maas-region units ({regions}) does not match the expected value from the backup ({})",
            controllers.len()
        )));
    }

    if !controllers.iter().any(|c| c == controller_id) {
        return Err(EngineError::ControllerMismatch(format!(
            "{controller_id} is not a valid ID from the controllers list; should be one of {}!",
            controllers.join(", ")
        )));
    }

    let parent = paths
        .controller_id_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let mut staged = NamedTempFile::new_in(parent)?;
    writeln!(staged, "{controller_id}")?;
    staged.flush()?;
    staged
        .persist(&paths.controller_id_file)
        .map_err(|e| EngineError::Io(e.error))?;
    info!(controller_id, "controller identity reassigned");
    Ok(())
}

/// Atomic-replace restoration of one archived directory: clear the
/// destination, verify it is gone, recreate it, download the archive to a
/// scoped temporary file, and extract.
async fn restore_artifact(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    backup_path: &str,
    filename: &str,
    dest: &Path,
    what: &str,
) -> Result<()> {
    // Stale files must not silently coexist with restored ones.
    match fs::remove_dir_all(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            error!(error = %e, dest = %dest.display(), "failed to clear destination");
        }
    }
    if dest.exists() {
        return Err(EngineError::StaleDestination(what.to_string()));
    }
    fs::create_dir_all(dest)?;

    info!("downloading {what} from s3");
    let key = config.object_key(&format!("{backup_path}/{filename}"));
    let staged = tempfile::Builder::new().suffix(".tar.gz").tempfile()?;
    download_to(store, &key, staged.path()).await?;

    archive::extract_tar_gz(staged.path(), dest, what)
}

/// Download an object to a local path, first checking that the filesystem
/// has room for it.
async fn download_to(store: &dyn ObjectStore, key: &str, dest: &Path) -> Result<()> {
    info!(bucket = store.bucket(), key, "download request");
    let Some(size) = store.object_size(key).await? else {
        return Err(EngineError::ObjectMissing {
            bucket: store.bucket().to_string(),
            key: key.to_string(),
        });
    };

    let available = free_disk_space(dest)?;
    if size >= available {
        return Err(EngineError::InsufficientSpace {
            key: key.to_string(),
            required: size,
            available,
        });
    }

    store.download_file(key, dest, &transfer_label(key)).await?;
    Ok(())
}

/// File-name stem of a key, for progress log labels.
fn transfer_label(key: &str) -> String {
    Path::new(key)
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.split('.').next().unwrap_or(name))
        .unwrap_or(key)
        .to_string()
}

#[cfg(unix)]
fn free_disk_space(path: &Path) -> Result<u64> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let stat = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| EngineError::Io(std::io::Error::from(e)))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
fn free_disk_space(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}
