//! Request and response types of the handler surface.

use serde::{Deserialize, Serialize};

use crate::crd::BackupStorageType;

/// Upgrade plan for every engine in a namespace. Computed on demand, never
/// stored.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePlan {
    pub upgrades: Vec<Upgrade>,
    pub pending_actions: Vec<UpgradeTask>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Upgrade {
    /// Name of the DatabaseEngine
    pub name: String,
    pub current_version: String,
    pub target_version: String,
}

/// Work a database cluster needs before or after an operator upgrade.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeTask {
    /// Name of the DatabaseCluster
    pub name: String,
    pub pending_task: PendingTask,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl UpgradeTask {
    pub fn ready(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending_task: PendingTask::Ready,
            message: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PendingTask {
    Ready,
    Restart,
    UpgradeEngine,
    NotReady,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDatabaseClusterParams {
    /// Also remove the cluster's backups from their storages
    #[serde(default)]
    pub cleanup_backup_storage: Option<bool>,
}

impl DeleteDatabaseClusterParams {
    pub fn cleanup(&self) -> bool {
        self.cleanup_backup_storage.unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupStorageRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub storage_type: BackupStorageType,
    pub bucket_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "verifyTLS", default, skip_serializing_if = "Option::is_none")]
    pub verify_tls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_path_style: Option<bool>,
}

/// Partial update of a backup storage. Absent fields are left unchanged.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBackupStorageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "verifyTLS", default, skip_serializing_if = "Option::is_none")]
    pub verify_tls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_path_style: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PmmCredentials {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl PmmCredentials {
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() || (!self.user.is_empty() && !self.password.is_empty())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateMonitoringInstanceRequest {
    pub name: String,
    /// Only "pmm" is supported
    #[serde(rename = "type")]
    pub monitoring_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmm: Option<PmmCredentials>,
    #[serde(rename = "verifyTLS", default, skip_serializing_if = "Option::is_none")]
    pub verify_tls: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMonitoringInstanceRequest {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub monitoring_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmm: Option<PmmCredentials>,
    #[serde(rename = "verifyTLS", default, skip_serializing_if = "Option::is_none")]
    pub verify_tls: Option<bool>,
}
