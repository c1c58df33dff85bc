/// Read-only catalog of previously created backups.
///
/// Backups are enumerated with a prefix-delimiter listing of
/// `<path>/backup/` rather than a recursive walk, then each candidate's
/// record is computed from the objects under its prefix. Nothing here
/// mutates the repository and nothing is cached between calls; any node may
/// list, not only the leader.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RepositoryConfig;
use crate::error::Result;
use crate::storage::ObjectStore;

pub const METADATA_FILENAME: &str = "backup_metadata.json";
pub const CONTROLLER_LIST_FILENAME: &str = "controllers.txt";
pub const IMAGE_TAR_FILENAME: &str = "image-storage.tar.gz";
pub const PRESEED_TAR_FILENAME: &str = "preseeds.tar.gz";

/// The metadata object finalizing one backup. Field names are part of the
/// repository format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupMetadata {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub maas_version: String,
    #[serde(default)]
    pub maas_snap_channel: String,
    #[serde(default)]
    pub unit_name: String,
    #[serde(default)]
    pub juju_version: String,
}

/// Derived view of one backup, computed from the stored objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: String,
    /// Aggregate size in bytes of every object under the backup's prefix.
    pub size: u64,
    pub controller_ids: Vec<String>,
    /// True only when the metadata reports success AND the full artifact
    /// set is present; an interrupted upload can leave either without the
    /// other.
    pub completed: bool,
    pub maas_version: String,
}

/// Identities of all backups under the repository's `backup/` prefix,
/// ascending (the timestamp format makes that oldest-first).
pub async fn backup_ids(store: &dyn ObjectStore, config: &RepositoryConfig) -> Result<Vec<String>> {
    let prefix = config.object_key("backup/");
    let mut ids: Vec<String> = store
        .list_prefixes(&prefix)
        .await?
        .into_iter()
        .filter_map(|p| {
            p.strip_prefix(&prefix)
                .map(|rest| rest.trim_end_matches('/').to_string())
        })
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort();
    Ok(ids)
}

/// Compute the record for one backup identity.
pub async fn backup_details(
    store: &dyn ObjectStore,
    config: &RepositoryConfig,
    backup_id: &str,
) -> Result<BackupRecord> {
    let prefix = config.object_key(&format!("backup/{backup_id}/"));
    let objects = store.list_objects(&prefix).await?;
    let size = objects.iter().map(|(_, len)| len).sum();
    let names: BTreeSet<&str> = objects
        .iter()
        .filter_map(|(key, _)| key.strip_prefix(&prefix))
        .collect();
    let complete_files = names
        == BTreeSet::from([
            METADATA_FILENAME,
            CONTROLLER_LIST_FILENAME,
            IMAGE_TAR_FILENAME,
            PRESEED_TAR_FILENAME,
        ]);

    let metadata_key = config.object_key(&format!("backup/{backup_id}/{METADATA_FILENAME}"));
    let metadata = match store.get_bytes(&metadata_key).await? {
        Some(bytes) => serde_json::from_slice::<BackupMetadata>(&bytes).unwrap_or_else(|e| {
            warn!(backup_id, error = %e, "unreadable backup metadata, treating as failed");
            BackupMetadata::default()
        }),
        None => BackupMetadata::default(),
    };

    let controllers_key = config.object_key(&format!("backup/{backup_id}/{CONTROLLER_LIST_FILENAME}"));
    let controller_ids = match store.get_bytes(&controllers_key).await? {
        Some(bytes) => parse_controller_list(&bytes),
        None => Vec::new(),
    };

    Ok(BackupRecord {
        id: backup_id.to_string(),
        size,
        controller_ids,
        completed: metadata.success && complete_files,
        maas_version: metadata.maas_version,
    })
}

/// Records for every backup in the repository, ascending by identity.
pub async fn list(store: &dyn ObjectStore, config: &RepositoryConfig) -> Result<Vec<BackupRecord>> {
    let mut records = Vec::new();
    for id in backup_ids(store, config).await? {
        records.push(backup_details(store, config, &id).await?);
    }
    Ok(records)
}

pub fn parse_controller_list(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .trim_matches('\n')
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Render records as the operator-facing table.
pub fn render_table(records: &[BackupRecord], config: &RepositoryConfig) -> String {
    let mut lines = vec![
        format!("Storage bucket name: {}", config.bucket),
        format!("Backups base path: /{}\n", config.object_key("backup/")),
        format!(
            "{:<20} | {:<11} | {:<8} | {:<8} | {:<10} | {:<22} | {}",
            "backup-id", "action", "status", "maas", "size", "controllers", "backup-path"
        ),
    ];
    lines.push("-".repeat(lines[2].len()));

    let mut sorted: Vec<&BackupRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    for record in sorted {
        let status = if record.completed { "finished" } else { "failed" };
        let backup_path = format!("/{}", config.object_key(&format!("backup/{}", record.id)));
        lines.push(format!(
            "{:<20} | {:<11} | {:<8} | {:<8} | {:<10} | {:<22} | {}",
            record.id,
            "full backup",
            status,
            record.maas_version,
            as_size(record.size),
            record.controller_ids.join(", "),
            backup_path
        ));
    }
    lines.join("\n")
}

/// Binary-prefixed representation of a byte count, e.g. `1.0MiB`.
pub fn as_size(size: u64) -> String {
    const PREFIXES: [&str; 7] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
    if size == 0 {
        return "0.0B".to_string();
    }
    let power = ((size as f64).log2() / 10.0).floor() as usize;
    let power = power.min(PREFIXES.len() - 1);
    format!(
        "{:.1}{}B",
        size as f64 / 1024f64.powi(power as i32),
        PREFIXES[power]
    )
}
