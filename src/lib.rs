pub mod config;
pub mod crd;
pub mod handlers;
pub mod health;
pub mod kubernetes;
pub mod server;
pub mod version;
pub mod version_service;

pub use config::{Config, ConfigError};
pub use handlers::k8s::{ExecutionHandler, RetryPolicy};
pub use handlers::rbac::{
    Enforcer, Policy, PolicySource, RbacHandler, ReloadingPolicy, UserGetter,
};
pub use handlers::validation::ValidationHandler;
pub use handlers::{Error, ErrorKind, Handler, RequestContext, Result};
pub use health::{HealthState, Metrics};
pub use kubernetes::{KubeClient, KubeConnector};
pub use server::{ApiState, ServerError, run_api_server};
pub use version_service::{HttpVersionService, VersionService};

use std::sync::Arc;

use async_trait::async_trait;

/// Assemble the request pipeline:
///
/// ```text
/// RbacHandler -> ValidationHandler -> ExecutionHandler
/// ```
///
/// The same chain serves production and tests; only the connector, version
/// service and enforcer differ.
pub fn build_pipeline(
    kube: Arc<dyn KubeConnector>,
    versions: Arc<dyn VersionService>,
    enforcer: Arc<dyn Enforcer>,
    user_getter: UserGetter,
    retry: RetryPolicy,
) -> Arc<dyn Handler> {
    let execution: Arc<dyn Handler> =
        Arc::new(ExecutionHandler::new(kube, versions).with_retry_policy(retry));
    let validation: Arc<dyn Handler> = Arc::new(ValidationHandler::new(execution));
    Arc::new(RbacHandler::new(validation, enforcer, user_getter))
}

/// Load the authorization policy from its ConfigMap.
pub async fn load_policy(client: &KubeClient, namespace: &str, name: &str) -> Result<Policy> {
    let cm = client.get_config_map(namespace, name).await?;
    let policy = Policy::from_config_map(&cm)?;
    tracing::info!(
        namespace = %namespace,
        name = %name,
        enabled = policy.is_enabled(),
        rules = policy.rules().len(),
        "Loaded authorization policy"
    );
    Ok(policy)
}

/// The RBAC ConfigMap as a [`PolicySource`].
#[derive(Clone)]
pub struct ConfigMapPolicy {
    client: KubeClient,
    namespace: String,
    name: String,
}

impl ConfigMapPolicy {
    pub fn new(client: KubeClient, namespace: &str, name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl PolicySource for ConfigMapPolicy {
    async fn load(&self) -> Result<Policy> {
        load_policy(&self.client, &self.namespace, &self.name).await
    }
}
