use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// OLM InstallPlan. Approving it lets OLM roll out the operator version it
/// carries. Only the fields this service reads or writes are modelled.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "InstallPlan",
    plural = "installplans",
    shortname = "ip",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanSpec {
    /// Automatic or Manual
    #[serde(default)]
    pub approval: String,

    #[serde(default)]
    pub approved: bool,

    #[serde(default, rename = "clusterServiceVersionNames")]
    pub csv_names: Vec<String>,
}
