use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// MonitoringConfig points database clusters at a monitoring server.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "everest.percona.com",
    version = "v1alpha1",
    kind = "MonitoringConfig",
    plural = "monitoringconfigs",
    shortname = "mc",
    namespaced,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.pmm.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfigSpec {
    #[serde(rename = "type")]
    pub monitoring_type: MonitoringType,

    #[serde(default)]
    pub pmm: PmmConfig,

    /// Secret holding the API key or user credentials
    pub credentials_secret_name: String,

    #[serde(rename = "verifyTLS", default, skip_serializing_if = "Option::is_none")]
    pub verify_tls: Option<bool>,
}

impl MonitoringConfig {
    pub fn secret_name_for(name: &str) -> String {
        format!("{name}-monitoring-credentials")
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringType {
    /// Percona Monitoring and Management
    Pmm,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PmmConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}
