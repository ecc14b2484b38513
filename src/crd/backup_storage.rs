use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label put on every DatabaseClusterBackup, naming the cluster it belongs to.
pub const CLUSTER_NAME_LABEL: &str = "clusterName";

/// BackupStorage is an object-store location database backups are written to.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "everest.percona.com",
    version = "v1alpha1",
    kind = "BackupStorage",
    plural = "backupstorages",
    namespaced,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Bucket", "type":"string", "jsonPath":".spec.bucket"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageSpec {
    #[serde(rename = "type")]
    pub storage_type: BackupStorageType,

    pub bucket: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    #[serde(rename = "endpointURL", default, skip_serializing_if = "String::is_empty")]
    pub endpoint_url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Secret holding the access and secret keys
    pub credentials_secret_name: String,

    #[serde(rename = "verifyTLS", default, skip_serializing_if = "Option::is_none")]
    pub verify_tls: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_path_style: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupStorageType {
    S3,
    Azure,
}

impl BackupStorageType {
    /// Secret keys holding the access key and the secret key.
    pub fn credential_keys(&self) -> (&'static str, &'static str) {
        match self {
            BackupStorageType::S3 => ("AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"),
            BackupStorageType::Azure => ("AZURE_STORAGE_ACCOUNT_NAME", "AZURE_STORAGE_ACCOUNT_KEY"),
        }
    }
}

impl BackupStorage {
    /// Name of the secret created for a storage's credentials.
    pub fn secret_name_for(name: &str) -> String {
        format!("{name}-backup-credentials")
    }
}

impl fmt::Display for BackupStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupStorageType::S3 => write!(f, "s3"),
            BackupStorageType::Azure => write!(f, "azure"),
        }
    }
}

/// DatabaseClusterBackup is a single backup taken from a DatabaseCluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "everest.percona.com",
    version = "v1alpha1",
    kind = "DatabaseClusterBackup",
    plural = "databaseclusterbackups",
    shortname = "dbbackup",
    namespaced,
    status = "DatabaseClusterBackupStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.dbClusterName"}"#,
    printcolumn = r#"{"name":"Storage", "type":"string", "jsonPath":".spec.backupStorageName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterBackupSpec {
    pub db_cluster_name: String,
    pub backup_storage_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterBackupStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<String>,
}
