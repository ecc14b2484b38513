//! Request-processing pipeline.
//!
//! Every API operation passes through a chain of [`Handler`]s. Each layer holds
//! the next one as `Arc<dyn Handler>` and either rejects the request or does
//! its own work and delegates:
//!
//! ```text
//! RbacHandler -> ValidationHandler -> ExecutionHandler -> Kubernetes
//! ```

mod error;
pub mod k8s;
pub mod rbac;
mod types;
pub mod validation;

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::crd::{
    BackupStorage, DatabaseCluster, DatabaseClusterBackup, DatabaseEngine, MonitoringConfig,
};

pub use error::{Error, ErrorKind, Result, ValidationError};
pub use types::*;

/// Per-request state carried down the chain.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    user: Option<String>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Authenticated user, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` unless the request is cancelled first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }
}

/// The operation surface shared by every layer of the pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn list_database_clusters(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<DatabaseCluster>>;
    async fn get_database_cluster(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseCluster>;
    async fn create_database_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &DatabaseCluster,
    ) -> Result<DatabaseCluster>;
    async fn update_database_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &DatabaseCluster,
    ) -> Result<DatabaseCluster>;
    async fn delete_database_cluster(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        params: &DeleteDatabaseClusterParams,
    ) -> Result<()>;

    /// Backups taken from the given cluster.
    async fn list_database_cluster_backups(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<DatabaseClusterBackup>>;

    async fn list_database_engines(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<DatabaseEngine>>;
    async fn get_database_engine(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseEngine>;
    async fn update_database_engine(
        &self,
        ctx: &RequestContext,
        engine: &DatabaseEngine,
    ) -> Result<DatabaseEngine>;

    async fn list_backup_storages(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<BackupStorage>>;
    async fn get_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<BackupStorage>;
    async fn create_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        req: &CreateBackupStorageRequest,
    ) -> Result<BackupStorage>;
    async fn update_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        req: &UpdateBackupStorageRequest,
    ) -> Result<BackupStorage>;
    async fn delete_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()>;

    async fn list_monitoring_instances(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<MonitoringConfig>>;
    async fn get_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<MonitoringConfig>;
    async fn create_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        req: &CreateMonitoringInstanceRequest,
    ) -> Result<MonitoringConfig>;
    async fn update_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        req: &UpdateMonitoringInstanceRequest,
    ) -> Result<MonitoringConfig>;
    async fn delete_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()>;

    async fn get_upgrade_plan(&self, ctx: &RequestContext, namespace: &str) -> Result<UpgradePlan>;
    async fn approve_upgrade_plan(&self, ctx: &RequestContext, namespace: &str) -> Result<()>;
}
