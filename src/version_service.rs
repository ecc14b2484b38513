//! Client for the Percona version service, which publishes the component
//! versions each operator release supports.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::crd::EngineType;
use crate::handlers::{Error, Result};

#[async_trait]
pub trait VersionService: Send + Sync {
    /// Engine versions supported by `operator_version` of the operator that
    /// manages `engine`.
    async fn supported_engine_versions(
        &self,
        engine: EngineType,
        operator_version: &str,
    ) -> Result<Vec<String>>;
}

#[derive(Deserialize, Debug)]
struct VersionResponse {
    #[serde(default)]
    versions: Vec<OperatorVersionMatrix>,
}

#[derive(Deserialize, Debug)]
struct OperatorVersionMatrix {
    #[serde(default)]
    matrix: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

#[derive(Clone, Debug)]
pub struct HttpVersionService {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpVersionService {
    pub fn new(base_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::VersionService(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn versions_url(&self, engine: EngineType, operator_version: &str) -> Result<Url> {
        let version = operator_version.trim_start_matches('v');
        self.base_url
            .join(&format!(
                "versions/v1/{}/{}",
                engine.version_service_product(),
                version
            ))
            .map_err(|e| Error::VersionService(format!("invalid version service URL: {e}")))
    }
}

#[async_trait]
impl VersionService for HttpVersionService {
    async fn supported_engine_versions(
        &self,
        engine: EngineType,
        operator_version: &str,
    ) -> Result<Vec<String>> {
        let url = self.versions_url(engine, operator_version)?;
        debug!(url = %url, "Querying version service");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::VersionService(e.to_string()))?;
        let body: VersionResponse = response
            .json()
            .await
            .map_err(|e| Error::VersionService(format!("invalid response: {e}")))?;

        let component = engine.engine_component();
        let versions = body
            .versions
            .into_iter()
            .next()
            .and_then(|mut v| v.matrix.remove(component))
            .ok_or_else(|| {
                Error::VersionService(format!(
                    "no '{component}' versions published for {} {operator_version}",
                    engine.version_service_product()
                ))
            })?;
        Ok(versions.into_keys().collect())
    }
}
