use std::collections::BTreeSet;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::EngineType;

/// DatabaseCluster is a database deployment managed by one of the engine
/// operators.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "everest.percona.com",
    version = "v1alpha1",
    kind = "DatabaseCluster",
    plural = "databaseclusters",
    shortname = "dbc",
    namespaced,
    status = "DatabaseClusterStatus",
    printcolumn = r#"{"name":"Engine", "type":"string", "jsonPath":".spec.engine.type"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.engine.version"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterSpec {
    pub engine: EngineSpec,

    #[serde(default)]
    pub proxy: ProxySpec,

    #[serde(default)]
    pub backup: BackupSpec,

    /// Sharding is only supported for psmdb
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingSpec>,

    /// Restore the new cluster from an existing backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<DataSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineSpec {
    #[serde(rename = "type")]
    pub engine_type: EngineType,

    /// Engine version. Empty lets the operator pick its recommended version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub resources: Resources,

    pub storage: Storage,
}

/// Resource limits, in Kubernetes quantity syntax (empty means zero)
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpu: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// Size of the data volume (e.g., "10Gi")
    pub size: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub proxy_type: Option<ProxyType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Mongos,
    Haproxy,
    Proxysql,
    Pgbouncer,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<BackupSchedule>,

    #[serde(default)]
    pub pitr: PitrSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub enabled: bool,

    /// Cron expression
    pub schedule: String,

    #[serde(default)]
    pub backup_storage_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_copies: Option<i32>,
}

/// Point-in-time recovery configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PitrSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_storage_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_interval_sec: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardingSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub shards: i32,

    #[serde(default)]
    pub config_server: ConfigServerSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigServerSpec {
    #[serde(default)]
    pub replicas: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    /// Name of a DatabaseClusterBackup to restore from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub db_cluster_backup_name: String,

    /// Inline backup location, mutually exclusive with the backup name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_source: Option<BackupSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitr: Option<PitrRecovery>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSource {
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub backup_storage_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PitrRecovery {
    /// Only "date" is supported; empty defaults to it
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub pitr_type: String,

    /// RFC 3339 timestamp to recover to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub monitoring_config_name: String,
}

/// Status of the DatabaseCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterStatus {
    #[serde(default)]
    pub status: AppState,

    /// Storage currently holding the cluster's backups (psmdb)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active_storage: String,

    /// Set when the operator requires a restart to adopt a new CR version
    #[serde(
        default,
        rename = "recommendedCRVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub recommended_cr_version: Option<String>,

    #[serde(default)]
    pub ready: i32,

    #[serde(default)]
    pub size: i32,
}

/// Cluster lifecycle state reported by the operator
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AppState {
    #[default]
    Unknown,
    New,
    Initializing,
    Ready,
    Paused,
    Pausing,
    Stopping,
    Error,
    Restoring,
    Deleting,
    Upgrading,
    ResizingVolumes,
}

impl AppState {
    /// States in which user-initiated spec changes are refused.
    pub fn blocks_updates(&self) -> bool {
        matches!(
            self,
            AppState::Restoring
                | AppState::Deleting
                | AppState::Upgrading
                | AppState::ResizingVolumes
        )
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppState::Unknown => "unknown",
            AppState::New => "new",
            AppState::Initializing => "initializing",
            AppState::Ready => "ready",
            AppState::Paused => "paused",
            AppState::Pausing => "pausing",
            AppState::Stopping => "stopping",
            AppState::Error => "error",
            AppState::Restoring => "restoring",
            AppState::Deleting => "deleting",
            AppState::Upgrading => "upgrading",
            AppState::ResizingVolumes => "resizingVolumes",
        };
        write!(f, "{s}")
    }
}

impl DatabaseCluster {
    pub fn engine_type(&self) -> EngineType {
        self.spec.engine.engine_type
    }

    pub fn app_state(&self) -> AppState {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn active_storage(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.active_storage.as_str())
            .unwrap_or_default()
    }

    pub fn recommended_cr_version(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.recommended_cr_version.as_deref())
            .filter(|v| !v.is_empty())
    }

    pub fn sharding_enabled(&self) -> bool {
        self.spec.sharding.as_ref().is_some_and(|s| s.enabled)
    }

    /// Distinct non-empty storages referenced by backup schedules.
    pub fn schedule_storages(&self) -> BTreeSet<&str> {
        self.spec
            .backup
            .schedules
            .iter()
            .map(|s| s.backup_storage_name.as_str())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Every backup storage the cluster refers to: schedules, PITR and the
    /// restore data source.
    pub fn referenced_backup_storages(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .schedule_storages()
            .into_iter()
            .map(str::to_string)
            .collect();
        if let Some(name) = self.spec.backup.pitr.backup_storage_name.as_deref()
            && !name.is_empty()
        {
            names.insert(name.to_string());
        }
        if let Some(source) = self
            .spec
            .data_source
            .as_ref()
            .and_then(|d| d.backup_source.as_ref())
            && !source.backup_storage_name.is_empty()
        {
            names.insert(source.backup_storage_name.clone());
        }
        names
    }

    pub fn monitoring_config_name(&self) -> Option<&str> {
        self.spec
            .monitoring
            .as_ref()
            .map(|m| m.monitoring_config_name.as_str())
            .filter(|n| !n.is_empty())
    }
}
