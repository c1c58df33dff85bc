/// Engine entry point.
///
/// The lifecycle dispatcher delivers triggers as a closed set of tagged
/// requests; this is the only way in. Each operation validates its
/// preconditions through the gate-keeper, builds a fresh store from the
/// relation's current parameters, and runs synchronously to completion on
/// the caller's task.
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::cluster::{ClusterContext, LocalPaths, StorageIntegration};
use crate::error::{EngineError, Result};
use crate::restore::RestoreRequest;
use crate::storage::StoreFactory;
use crate::storage::s3::S3StoreFactory;
use crate::{backup, catalog, repository, restore};

/// Operation requests consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Storage credentials appeared or changed.
    CredentialsChanged,
    /// The storage relation went away.
    CredentialsGone,
    CreateBackup,
    ListBackups,
    RestoreBackup {
        backup_id: String,
        controller_id: String,
    },
}

/// What the dispatcher should do after an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Trigger handled; nothing to report.
    Handled,
    /// Results for the invoking command.
    Results(BTreeMap<String, String>),
    /// The repository is unusable until the operator reconfigures it.
    Blocked(String),
    /// A previously reported storage block no longer applies.
    Unblocked,
    /// Connection data is incomplete; retry on a later trigger.
    Deferred,
    /// Not relevant for this node.
    Ignored,
}

pub struct Engine {
    cluster: Arc<dyn ClusterContext>,
    relation: Arc<dyn StorageIntegration>,
    stores: Arc<dyn StoreFactory>,
    paths: LocalPaths,
}

impl Engine {
    pub fn new(
        cluster: Arc<dyn ClusterContext>,
        relation: Arc<dyn StorageIntegration>,
        stores: Arc<dyn StoreFactory>,
        paths: LocalPaths,
    ) -> Self {
        Self {
            cluster,
            relation,
            stores,
            paths,
        }
    }

    /// Engine wired to the S3 backend at the default local paths.
    pub fn with_s3(
        cluster: Arc<dyn ClusterContext>,
        relation: Arc<dyn StorageIntegration>,
    ) -> Self {
        Self::new(
            cluster,
            relation,
            Arc::new(S3StoreFactory),
            LocalPaths::default(),
        )
    }

    /// Single entry point for every trigger. Errors carry the operator
    /// message via [`EngineError::operator_message`].
    pub async fn handle(&self, operation: Operation) -> Result<Outcome> {
        match operation {
            Operation::CredentialsChanged => self.on_credentials_changed().await,
            Operation::CredentialsGone => Ok(self.on_credentials_gone()),
            Operation::CreateBackup => self.on_create_backup().await,
            Operation::ListBackups => self.on_list_backups().await,
            Operation::RestoreBackup {
                backup_id,
                controller_id,
            } => self.on_restore_backup(backup_id, controller_id).await,
        }
    }

    /// Claim or re-validate the repository whenever credentials change.
    /// Also runs after leader election: the departed leader was the one
    /// holding the repository marker up to date.
    async fn on_credentials_changed(&self) -> Result<Outcome> {
        if !self.cluster.is_leader() {
            return Ok(Outcome::Ignored);
        }
        let config = match repository::settings_ok(self.relation.as_ref()) {
            Ok(config) => config,
            Err(_) => return Ok(Outcome::Deferred),
        };

        let store = self.stores.build(&config)?;
        if let Err(e) = store.ensure_bucket().await {
            error!(error = %e, "could not access or create the bucket");
            return Ok(Outcome::Blocked(
                repository::FAILED_TO_ACCESS_CREATE_BUCKET_ERROR_MESSAGE.to_string(),
            ));
        }

        let cluster_uuid = self.cluster.cluster_uuid();
        match repository::check_compatible(store.as_ref(), &config, &cluster_uuid).await {
            Ok(()) => {}
            Err(EngineError::ForeignRepository) => {
                return Ok(Outcome::Blocked(
                    EngineError::ForeignRepository.to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = repository::claim(store.as_ref(), &config, &cluster_uuid).await {
            warn!(error = %e, "failed to write repository marker");
        }
        Ok(Outcome::Handled)
    }

    fn on_credentials_gone(&self) -> Outcome {
        match self.cluster.blocked_status() {
            Some(message) if repository::S3_BLOCK_MESSAGES.contains(&message.as_str()) => {
                Outcome::Unblocked
            }
            _ => Outcome::Handled,
        }
    }

    async fn on_create_backup(&self) -> Result<Outcome> {
        if !self.cluster.is_leader() {
            return Err(EngineError::NotLeader);
        }
        if self.cluster.blocked_status().is_some() {
            return Err(EngineError::UnitBlocked);
        }
        let config = repository::settings_ok(self.relation.as_ref())?;

        let store = self.stores.build(&config)?;
        let backup_id =
            backup::create_backup(store.as_ref(), &config, self.cluster.as_ref(), &self.paths)
                .await?;

        Ok(Outcome::Results(BTreeMap::from([(
            "backups".to_string(),
            format!("backup created with id {backup_id}"),
        )])))
    }

    async fn on_list_backups(&self) -> Result<Outcome> {
        let config = repository::settings_ok(self.relation.as_ref())?;
        let store = self.stores.build(&config)?;

        let records = match catalog::list(store.as_ref(), &config).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to list backups");
                return Err(EngineError::Operation(format!(
                    "Failed to list MAAS backups with error: {e}"
                )));
            }
        };
        Ok(Outcome::Results(BTreeMap::from([(
            "backups".to_string(),
            catalog::render_table(&records, &config),
        )])))
    }

    async fn on_restore_backup(
        &self,
        backup_id: String,
        controller_id: String,
    ) -> Result<Outcome> {
        let request = RestoreRequest {
            backup_id,
            controller_id,
        };
        let config =
            restore::pre_restore_checks(self.relation.as_ref(), self.cluster.as_ref(), &request)?;
        info!(
            backup_id = %request.backup_id,
            controller_id = %request.controller_id,
            "restore requested"
        );

        let store = self.stores.build(&config)?;
        restore::restore_backup(
            store.as_ref(),
            &config,
            self.cluster.as_ref(),
            &self.paths,
            &request,
        )
        .await?;

        Ok(Outcome::Results(BTreeMap::from([(
            "restore-status".to_string(),
            "restore finished".to_string(),
        )])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{TestCluster, TestRelation};
    use crate::storage::memory::{MemoryStore, MemoryStoreFactory};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        engine: Engine,
        store: Arc<MemoryStore>,
        _root: TempDir,
    }

    fn fixture(cluster: TestCluster, relation: TestRelation) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let paths = LocalPaths::rooted_at(root.path());
        fs::create_dir_all(&paths.image_storage).unwrap();
        fs::write(paths.image_storage.join("boot.img"), b"image data").unwrap();
        fs::create_dir_all(&paths.preseeds).unwrap();
        fs::write(paths.preseeds.join("curtin_userdata"), b"preseed data").unwrap();

        let store = Arc::new(MemoryStore::new("maas-backups"));
        let engine = Engine::new(
            Arc::new(cluster),
            Arc::new(relation),
            Arc::new(MemoryStoreFactory(store.clone())),
            paths,
        );
        Fixture {
            engine,
            store,
            _root: root,
        }
    }

    #[tokio::test]
    async fn test_create_backup_reports_identity() {
        let f = fixture(TestCluster::default(), TestRelation::complete());
        let outcome = f.engine.handle(Operation::CreateBackup).await.unwrap();
        let Outcome::Results(results) = outcome else {
            panic!("expected results");
        };
        let message = results.get("backups").unwrap();
        assert!(message.starts_with("backup created with id "));

        let id = message.trim_start_matches("backup created with id ");
        assert!(f.store.keys().contains(&format!(
            "backup/{id}/backup_metadata.json"
        )));
    }

    #[tokio::test]
    async fn test_create_backup_requires_leadership() {
        let f = fixture(
            TestCluster {
                leader: false,
                ..TestCluster::default()
            },
            TestRelation::complete(),
        );
        let err = f.engine.handle(Operation::CreateBackup).await.unwrap_err();
        assert_eq!(err.operator_message(), "Unit is not the leader");
        assert!(f.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_create_backup_requires_unblocked_unit() {
        let f = fixture(
            TestCluster {
                blocked: Some("database unavailable".to_string()),
                ..TestCluster::default()
            },
            TestRelation::complete(),
        );
        let err = f.engine.handle(Operation::CreateBackup).await.unwrap_err();
        assert_eq!(err.operator_message(), "Unit is in a blocking state");
    }

    #[tokio::test]
    async fn test_create_backup_requires_relation() {
        let f = fixture(TestCluster::default(), TestRelation::absent());
        let err = f.engine.handle(Operation::CreateBackup).await.unwrap_err();
        assert!(matches!(err, EngineError::RelationMissing));
    }

    #[tokio::test]
    async fn test_backup_then_list_round_trip() {
        let f = fixture(TestCluster::default(), TestRelation::complete());
        f.engine.handle(Operation::CreateBackup).await.unwrap();

        let outcome = f.engine.handle(Operation::ListBackups).await.unwrap();
        let Outcome::Results(results) = outcome else {
            panic!("expected results");
        };
        let table = results.get("backups").unwrap();
        assert!(table.contains("full backup"));
        assert!(table.contains("finished"));

        // Listing twice yields byte-identical output.
        let Outcome::Results(again) = f.engine.handle(Operation::ListBackups).await.unwrap()
        else {
            panic!("expected results");
        };
        assert_eq!(results, again);
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let f = fixture(TestCluster::default(), TestRelation::complete());
        let Outcome::Results(results) = f.engine.handle(Operation::CreateBackup).await.unwrap()
        else {
            panic!("expected results");
        };
        let backup_id = results
            .get("backups")
            .unwrap()
            .trim_start_matches("backup created with id ")
            .to_string();

        let outcome = f
            .engine
            .handle(Operation::RestoreBackup {
                backup_id,
                controller_id: "abc123".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Results(BTreeMap::from([(
                "restore-status".to_string(),
                "restore finished".to_string()
            )]))
        );
    }

    #[tokio::test]
    async fn test_restore_requires_parameters() {
        let f = fixture(TestCluster::default(), TestRelation::complete());
        let err = f
            .engine
            .handle(Operation::RestoreBackup {
                backup_id: String::new(),
                controller_id: "abc123".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.operator_message(),
            "The 'backup-id' parameter must be specified to perform a restore"
        );
    }

    #[tokio::test]
    async fn test_credentials_changed_claims_repository() {
        let f = fixture(TestCluster::default(), TestRelation::complete());
        let outcome = f
            .engine
            .handle(Operation::CredentialsChanged)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);
        assert_eq!(
            f.store.get("model-uuid.txt"),
            Some(TestCluster::default().uuid.into_bytes())
        );
    }

    #[tokio::test]
    async fn test_credentials_changed_ignored_on_non_leader() {
        let f = fixture(
            TestCluster {
                leader: false,
                ..TestCluster::default()
            },
            TestRelation::complete(),
        );
        let outcome = f
            .engine
            .handle(Operation::CredentialsChanged)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Ignored);
        assert!(f.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_credentials_changed_defers_on_incomplete_settings() {
        let f = fixture(TestCluster::default(), TestRelation::absent());
        let outcome = f
            .engine
            .handle(Operation::CredentialsChanged)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Deferred);
    }

    #[tokio::test]
    async fn test_credentials_changed_blocks_on_foreign_repository() {
        let f = fixture(TestCluster::default(), TestRelation::complete());
        f.store.insert("model-uuid.txt", b"someone-else");

        let outcome = f
            .engine
            .handle(Operation::CredentialsChanged)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Blocked("the S3 repository has backups from another cluster".to_string())
        );
        // First writer wins: the marker was not overwritten.
        assert_eq!(f.store.get("model-uuid.txt"), Some(b"someone-else".to_vec()));
    }

    #[tokio::test]
    async fn test_credentials_gone_clears_engine_blocks_only() {
        let f = fixture(
            TestCluster {
                blocked: Some(
                    repository::FAILED_TO_ACCESS_CREATE_BUCKET_ERROR_MESSAGE.to_string(),
                ),
                ..TestCluster::default()
            },
            TestRelation::absent(),
        );
        let outcome = f.engine.handle(Operation::CredentialsGone).await.unwrap();
        assert_eq!(outcome, Outcome::Unblocked);

        let f = fixture(
            TestCluster {
                blocked: Some("database unavailable".to_string()),
                ..TestCluster::default()
            },
            TestRelation::absent(),
        );
        let outcome = f.engine.handle(Operation::CredentialsGone).await.unwrap();
        assert_eq!(outcome, Outcome::Handled);
    }
}
