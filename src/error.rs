use thiserror::Error;

/// Suffix appended to operator-facing failures whose full cause only appears
/// in the diagnostic log.
pub const REFER_TO_DEBUG_LOG: &str = " Please check the juju debug-log for more details.";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Relation with s3-integrator charm missing, cannot create/restore backup.")]
    RelationMissing,

    #[error("Missing S3 parameters: {0:?}")]
    MissingConfiguration(Vec<String>),

    #[error("the S3 repository has backups from another cluster")]
    ForeignRepository,

    #[error("Unit is not the leader")]
    NotLeader,

    #[error("Unit is in a blocking state")]
    UnitBlocked,

    #[error("Cluster or unit is in a blocking state")]
    ClusterBlocked,

    #[error("The '{0}' parameter must be specified to perform a restore")]
    MissingActionParameter(&'static str),

    #[error(
        "PostgreSQL relation still exists, please run:\njuju remove-relation {app} {db_app}\nthen retry this action"
    )]
    DatabaseRelationActive { app: String, db_app: String },

    #[error("Failed to retrieve region ids from the MAAS API")]
    RegionsNotAvailable,

    #[error("Invalid backup-id: {0}")]
    InvalidBackupId(String),

    #[error("{0}")]
    VersionMismatch(String),

    #[error("{0}")]
    ControllerMismatch(String),

    #[error("Could not remove existing {0}")]
    StaleDestination(String),

    #[error("{what} is not a valid .tar.gz file or is corrupted")]
    CorruptArchive { what: String },

    #[error("{what} from S3 did not contain any files")]
    EmptyArchive { what: String },

    #[error("Filesystem error while extracting {what}: {source}")]
    Filesystem {
        what: String,
        source: std::io::Error,
    },

    #[error("Not enough free storage to download {key}, required {required} but has {available}")]
    InsufficientSpace {
        key: String,
        required: u64,
        available: u64,
    },

    #[error("Could not find object in {bucket}:{key}")]
    ObjectMissing { bucket: String, key: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Orchestrator-level failure already phrased for the operator.
    #[error("{0}")]
    Operation(String),
}

impl EngineError {
    /// Render the single human-readable message handed back to the invoking
    /// command. Configuration and validation failures are reported verbatim;
    /// operational failures point the operator at the diagnostic log, where
    /// the full cause was already recorded.
    pub fn operator_message(&self) -> String {
        match self {
            Self::RelationMissing
            | Self::MissingConfiguration(_)
            | Self::ForeignRepository
            | Self::NotLeader
            | Self::UnitBlocked
            | Self::ClusterBlocked
            | Self::MissingActionParameter(_)
            | Self::DatabaseRelationActive { .. }
            | Self::InvalidBackupId(_)
            | Self::VersionMismatch(_)
            | Self::ControllerMismatch(_) => self.to_string(),
            _ => format!("{self}{REFER_TO_DEBUG_LOG}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
