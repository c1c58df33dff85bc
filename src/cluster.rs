/// Collaborator interfaces for the backup/restore engine.
///
/// The engine owns none of the cluster machinery: leadership, membership,
/// relation data, and workload versions all come from the surrounding
/// control plane. These traits are the seams through which that state is
/// consumed, so orchestrators can be exercised against test doubles.
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

/// Cluster-side view required by the orchestrators: leadership, blocking
/// state, peer membership, and the workload/orchestrator versions captured
/// in backup metadata.
#[async_trait]
pub trait ClusterContext: Send + Sync {
    /// Whether this node is the cluster leader.
    fn is_leader(&self) -> bool;

    /// The unit's current blocking condition, if any.
    fn blocked_status(&self) -> Option<String>;

    /// Identity of the cluster instance (the model uuid), recorded in the
    /// repository marker.
    fn cluster_uuid(&self) -> String;

    fn unit_name(&self) -> String;

    fn app_name(&self) -> String;

    fn juju_version(&self) -> String;

    /// Name of the application holding a live database relation, if one
    /// exists. Restores refuse to run while it does.
    fn database_relation(&self) -> Option<String>;

    /// Number of controller peers, including the local node, or `None` when
    /// the peer relation is missing.
    fn peer_count(&self) -> Option<usize>;

    /// Enumerate controller system ids through the control plane's own
    /// administrative API.
    async fn controller_system_ids(&self) -> Result<BTreeSet<String>>;

    /// Installed workload version, or `None` if not installed.
    fn installed_version(&self) -> Option<String>;

    /// Installed snap channel, or `None` if not installed.
    fn installed_channel(&self) -> Option<String>;
}

/// Source of the storage-integration relation's connection data.
/// `None` means the relation itself is absent.
pub trait StorageIntegration: Send + Sync {
    fn connection_info(&self) -> Option<BTreeMap<String, String>>;
}

/// Fixed local filesystem locations owned by the installation manager. The
/// engine reads them during backup and overwrites them during restore.
#[derive(Debug, Clone)]
pub struct LocalPaths {
    /// File holding this node's controller identity.
    pub controller_id_file: PathBuf,
    /// Image cache directory.
    pub image_storage: PathBuf,
    /// Preseed template directory.
    pub preseeds: PathBuf,
}

impl Default for LocalPaths {
    fn default() -> Self {
        Self {
            controller_id_file: PathBuf::from("/var/snap/maas/common/maas/maas_id"),
            image_storage: PathBuf::from("/var/snap/maas/common/maas/image-storage"),
            preseeds: PathBuf::from("/var/snap/maas/current/preseeds"),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::error::EngineError;
    use std::path::Path;

    /// Configurable [`ClusterContext`] double for orchestrator tests.
    pub struct TestCluster {
        pub leader: bool,
        pub blocked: Option<String>,
        pub uuid: String,
        pub unit: String,
        pub app: String,
        pub juju: String,
        pub db_relation: Option<String>,
        pub peers: Option<usize>,
        pub controllers: Option<BTreeSet<String>>,
        pub version: Option<String>,
        pub channel: Option<String>,
    }

    impl Default for TestCluster {
        fn default() -> Self {
            Self {
                leader: true,
                blocked: None,
                uuid: "6e4c392f-6c41-4bbc-9d70-cc3c5d088661".to_string(),
                unit: "maas-region/0".to_string(),
                app: "maas-region".to_string(),
                juju: "3.6.2".to_string(),
                db_relation: None,
                peers: Some(1),
                controllers: Some(BTreeSet::from(["abc123".to_string()])),
                version: Some("3.6.1".to_string()),
                channel: Some("3.6/stable".to_string()),
            }
        }
    }

    #[async_trait]
    impl ClusterContext for TestCluster {
        fn is_leader(&self) -> bool {
            self.leader
        }

        fn blocked_status(&self) -> Option<String> {
            self.blocked.clone()
        }

        fn cluster_uuid(&self) -> String {
            self.uuid.clone()
        }

        fn unit_name(&self) -> String {
            self.unit.clone()
        }

        fn app_name(&self) -> String {
            self.app.clone()
        }

        fn juju_version(&self) -> String {
            self.juju.clone()
        }

        fn database_relation(&self) -> Option<String> {
            self.db_relation.clone()
        }

        fn peer_count(&self) -> Option<usize> {
            self.peers
        }

        async fn controller_system_ids(&self) -> Result<BTreeSet<String>> {
            self.controllers
                .clone()
                .ok_or(EngineError::RegionsNotAvailable)
        }

        fn installed_version(&self) -> Option<String> {
            self.version.clone()
        }

        fn installed_channel(&self) -> Option<String> {
            self.channel.clone()
        }
    }

    /// [`StorageIntegration`] double carrying a fixed connection map.
    pub struct TestRelation(pub Option<BTreeMap<String, String>>);

    impl TestRelation {
        pub fn complete() -> Self {
            Self(Some(BTreeMap::from([
                ("bucket".to_string(), "maas-backups".to_string()),
                ("access-key".to_string(), "AKIA123".to_string()),
                ("secret-key".to_string(), "s3cr3t".to_string()),
            ])))
        }

        pub fn absent() -> Self {
            Self(None)
        }
    }

    impl StorageIntegration for TestRelation {
        fn connection_info(&self) -> Option<BTreeMap<String, String>> {
            self.0.clone()
        }
    }

    impl LocalPaths {
        /// Paths rooted inside a test directory.
        pub fn rooted_at(root: &Path) -> Self {
            Self {
                controller_id_file: root.join("maas_id"),
                image_storage: root.join("image-storage"),
                preseeds: root.join("preseeds"),
            }
        }
    }
}
