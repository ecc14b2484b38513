use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::version;

/// Annotation set on a DatabaseEngine while an operator upgrade is in flight.
pub const UPGRADE_LOCK_ANNOTATION: &str = "everest.percona.com/upgrade-lock";

/// DatabaseEngine describes an installed database operator and the engine
/// versions it can run.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "everest.percona.com",
    version = "v1alpha1",
    kind = "DatabaseEngine",
    plural = "databaseengines",
    shortname = "dbengine",
    namespaced,
    status = "DatabaseEngineStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Operator Version", "type":"string", "jsonPath":".status.operatorVersion"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEngineSpec {
    /// Engine family managed by the operator
    #[serde(rename = "type")]
    pub engine_type: EngineType,

    /// Engine versions users may deploy. Empty means every available version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_versions: Vec<String>,
}

/// Database engine family
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// Percona XtraDB Cluster (MySQL)
    Pxc,
    /// Percona Server for MongoDB
    Psmdb,
    /// Percona Distribution for PostgreSQL
    Postgresql,
}

impl EngineType {
    pub const ALL: [EngineType; 3] = [EngineType::Pxc, EngineType::Psmdb, EngineType::Postgresql];

    /// Name of the operator deployment, which is also the DatabaseEngine name.
    pub fn operator_name(&self) -> &'static str {
        match self {
            EngineType::Pxc => "percona-xtradb-cluster-operator",
            EngineType::Psmdb => "percona-server-mongodb-operator",
            EngineType::Postgresql => "percona-postgresql-operator",
        }
    }

    /// Product name used by the version service.
    pub fn version_service_product(&self) -> &'static str {
        match self {
            EngineType::Pxc => "pxc-operator",
            EngineType::Psmdb => "psmdb-operator",
            EngineType::Postgresql => "pg-operator",
        }
    }

    /// Key of the engine component inside a version-service matrix.
    pub fn engine_component(&self) -> &'static str {
        match self {
            EngineType::Pxc => "pxc",
            EngineType::Psmdb => "mongod",
            EngineType::Postgresql => "postgresql",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineType::Pxc => write!(f, "pxc"),
            EngineType::Psmdb => write!(f, "psmdb"),
            EngineType::Postgresql => write!(f, "postgresql"),
        }
    }
}

/// Status of the DatabaseEngine
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEngineStatus {
    /// Installation state reported by the engine controller
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    /// Version of the running operator
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator_version: String,

    #[serde(default)]
    pub available_versions: AvailableVersions,

    /// Operator upgrades published by OLM and awaiting approval
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_operator_upgrades: Vec<OperatorUpgrade>,
}

/// Component versions the running operator supports, keyed by version.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableVersions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engine: BTreeMap<String, Component>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backup: BTreeMap<String, Component>,

    /// Proxy components keyed by proxy type, then version
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub proxy: BTreeMap<String, BTreeMap<String, Component>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_hash: String,

    /// recommended, available or unavailable
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    #[serde(default)]
    pub critical: bool,
}

/// A pending operator upgrade
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorUpgrade {
    pub target_version: String,

    /// InstallPlan that must be approved to perform the upgrade
    pub install_plan_ref: LocalObjectRef,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct LocalObjectRef {
    pub name: String,
}

impl DatabaseEngine {
    pub fn status_ref(&self) -> Option<&DatabaseEngineStatus> {
        self.status.as_ref()
    }

    pub fn operator_version(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.operator_version.as_str())
            .unwrap_or_default()
    }

    pub fn pending_upgrades(&self) -> &[OperatorUpgrade] {
        self.status
            .as_ref()
            .map(|s| s.pending_operator_upgrades.as_slice())
            .unwrap_or_default()
    }

    /// Lowest pending target version in semantic-version order.
    pub fn next_upgrade_version(&self) -> Option<&str> {
        self.pending_upgrades()
            .iter()
            .map(|u| u.target_version.as_str())
            .min_by(|a, b| version::compare(a, b))
    }

    pub fn pending_upgrade(&self, target_version: &str) -> Option<&OperatorUpgrade> {
        self.pending_upgrades()
            .iter()
            .find(|u| u.target_version == target_version)
    }

    pub fn has_available_engine_version(&self, version: &str) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.available_versions.engine.contains_key(version))
    }

    pub fn is_upgrade_locked(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(UPGRADE_LOCK_ANNOTATION))
            .is_some_and(|v| v == "true")
    }

    /// Returns true when the lock flag changed.
    pub fn set_upgrade_lock(&mut self, locked: bool) -> bool {
        if self.is_upgrade_locked() == locked {
            return false;
        }
        let annotations = self.metadata.annotations.get_or_insert_with(BTreeMap::new);
        if locked {
            annotations.insert(UPGRADE_LOCK_ANNOTATION.to_string(), "true".to_string());
        } else {
            annotations.remove(UPGRADE_LOCK_ANNOTATION);
        }
        true
    }
}
