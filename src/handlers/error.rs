//! Error types for the request pipeline

use thiserror::Error;

use crate::crd::{AppState, EngineType};

/// Broad error class, used by the HTTP layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    InvalidInput,
    NotFound,
    Failed,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("insufficient permissions for performing the operation")]
    InsufficientPermissions,

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] ValidationError),

    #[error("provided target version is not available for upgrade")]
    UpgradeUnavailable,

    #[error("invalid target version provided for upgrade: {0}")]
    InvalidTargetVersion(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("one or more database clusters are not ready for upgrade")]
    ClustersNotReady,

    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("version service error: {0}")]
    VersionService(String),

    #[error("invalid policy: {0}")]
    Policy(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Execution {
        context: String,
        source: Box<Error>,
    },

    #[error("{error}; failed to release upgrade locks: {release}")]
    Compensation {
        error: Box<Error>,
        release: Box<Error>,
    },
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Wrap the error with a description of the step that failed. The kind of
    /// the wrapped error is preserved.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Execution {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InsufficientPermissions => ErrorKind::Unauthorized,
            Error::InvalidRequest(_)
            | Error::UpgradeUnavailable
            | Error::InvalidTargetVersion(_) => ErrorKind::InvalidInput,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 404 => {
                ErrorKind::NotFound
            }
            Error::Execution { source, .. } => source.kind(),
            Error::Compensation { error, .. } => error.kind(),
            Error::ClustersNotReady
            | Error::Preflight(_)
            | Error::KubeError(_)
            | Error::SerializationError(_)
            | Error::VersionService(_)
            | Error::Policy(_)
            | Error::Cancelled => ErrorKind::Failed,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Whether retrying the failed call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                kube::Error::SerdeError(_) => false,
                // Transport errors
                _ => true,
            },
            Error::VersionService(_) => true,
            Error::Execution { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A rejected admission rule. Each variant names one broken invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("namespace cannot be empty")]
    EmptyNamespace,

    #[error("name cannot be empty")]
    EmptyName,

    #[error(
        "'{0}' is not RFC 1035 compatible. The name should contain only lowercase alphanumeric \
         characters or '-', start with an alphabetic character, end with an alphanumeric \
         character and be at most 63 characters long"
    )]
    InvalidName(String),

    #[error("{kind} '{name}' already exists in namespace '{namespace}'")]
    AlreadyExists {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("database engine '{0}' is not installed in the namespace")]
    EngineNotInstalled(EngineType),

    #[error("using {version} version for {engine} is not allowed")]
    VersionNotAllowed { version: String, engine: EngineType },

    #[error("{version} is not in available versions list")]
    VersionNotAvailable { version: String },

    #[error("engine replicas cannot be even")]
    EvenEngineReplicas,

    #[error("engine replicas cannot be greater than {max}")]
    TooManyEngineReplicas { max: i32 },

    #[error("proxy replicas cannot be less than {min}")]
    TooFewProxyReplicas { min: i32 },

    #[error("you can use either HAProxy or Proxy SQL for MySQL clusters")]
    UnsupportedPxcProxy,

    #[error("you can use only Mongos as a proxy")]
    UnsupportedPsmdbProxy,

    #[error("you can use only PGBouncer as a proxy type for Postgres clusters")]
    UnsupportedPgProxy,

    #[error("'backupStorageName' field cannot be empty when pitr is enabled")]
    PitrNoBackupStorageName,

    #[error("'uploadIntervalSec' should either be empty or greater than 0")]
    PitrUploadInterval,

    #[error("'name' field for the backup schedules cannot be empty")]
    NoNameInSchedule,

    #[error("'backupStorageName' field cannot be empty when schedule is enabled")]
    ScheduleNoBackupStorageName,

    #[error("backup schedules must have unique cron expressions")]
    DuplicatedSchedules,

    #[error("can't use more than one backup storage for PSMDB clusters")]
    PsmdbMultipleStorages,

    #[error("cannot use a different storage while the cluster's active storage is '{active}'")]
    PsmdbViolateActiveStorage { active: String },

    #[error("point-in-time recovery can be enabled only with an S3 storage for MySQL clusters")]
    PxcPitrS3Only,

    #[error("backup storage '{0}' not found")]
    BackupStorageNotFound(String),

    #[error("monitoring config '{0}' not found")]
    MonitoringConfigNotFound(String),

    #[error("either DBClusterBackupName or BackupSource must be specified in the DataSource field")]
    DataSourceConfig,

    #[error("'backupStorageName' is required for the data source")]
    DataSourceNoBackupStorageName,

    #[error("'path' is required for the data source")]
    DataSourceNoPath,

    #[error("'date' is required in the data source PITR section")]
    DataSourceNoPitrDate,

    #[error(
        "failed to parse the data source PITR date; use the RFC 3339 format \
         (e.g. 2023-10-10T10:10:10Z)"
    )]
    DataSourceWrongDateFormat,

    #[error("the given point-in-time recovery type '{0}' is not supported")]
    UnsupportedPitrType(String),

    #[error("a storage can only be used by one backup schedule in a postgres cluster")]
    DuplicatedStoragePg,

    #[error("the backup storage of an existing schedule cannot be changed in a postgres cluster")]
    StorageChangePg,

    #[error("only {limit} different storages are allowed in a {engine} cluster")]
    TooManyStorages { limit: usize, engine: EngineType },

    #[error("sharding is not supported for {0}")]
    ShardingNotSupported(EngineType),

    #[error("sharding is available starting PSMDB {min}")]
    ShardingVersion { min: String },

    #[error("shards number should be greater than {min}")]
    InsufficientShards { min: i32 },

    #[error(
        "sharded psmdb cluster that contains more than 1 node must have at least {min} \
         config servers"
    )]
    InsufficientConfigServers { min: i32 },

    #[error("sharded psmdb cluster that contains 1 node must have at least {min} config server")]
    InsufficientConfigServersSingleNode { min: i32 },

    #[error("config servers number should be odd")]
    EvenConfigServers,

    #[error("sharding is not supported for existing clusters")]
    ShardingEnablingNotSupported,

    #[error("disabling sharding is not supported")]
    ShardingDisablingNotSupported,

    #[error("no resources specified")]
    NoResourcesDefined,

    #[error("CPU limits should be above {min}")]
    NotEnoughCpu { min: &'static str },

    #[error("memory limits should be above {min}")]
    NotEnoughMemory { min: &'static str },

    #[error("storage size should be above {min}")]
    NotEnoughDiskSize { min: &'static str },

    #[error("invalid {field} quantity '{value}'")]
    InvalidQuantity { field: &'static str, value: String },

    #[error("cannot perform the update while the database cluster is in '{0}' state")]
    UpdateNotAllowedInState(AppState),

    #[error("invalid database engine version '{0}'")]
    InvalidVersion(String),

    #[error("shrinking database cluster storage is not supported")]
    CannotShrinkStorage,

    #[error("cannot scale down a {from}-node cluster to a single node")]
    ScaleDownToSingleNode { from: i32 },

    #[error("database engine cannot be downgraded")]
    EngineDowngrade,

    #[error("database engine cannot be upgraded to a major version")]
    MajorVersionUpgrade,

    #[error("database engine cannot be upgraded to a major version that is not the next one")]
    MajorUpgradeNotSequential,

    #[error("'bucketName' cannot be empty")]
    EmptyBucket,

    #[error("region is required when using S3 storage type")]
    S3RegionRequired,

    #[error("'{field}' is an invalid URL")]
    InvalidUrl { field: &'static str },

    #[error("'accessKey' and 'secretKey' are required")]
    MissingCredentials,

    #[error("backup storage '{name}' is used by database cluster '{cluster}'")]
    BackupStorageInUse { name: String, cluster: String },

    #[error("monitoring type '{0}' is not supported")]
    UnsupportedMonitoringType(String),

    #[error("'pmm' configuration is required when using the pmm type")]
    MissingPmmConfig,

    #[error("either 'apiKey' or 'user' and 'password' are required for pmm")]
    MissingPmmCredentials,

    #[error("database engine type cannot be changed")]
    EngineTypeImmutable,

    #[error("allowed version '{0}' is not available for the engine")]
    AllowedVersionUnavailable(String),
}
