//! Admission layer of the pipeline.
//!
//! Mutating requests are checked against the rules in the submodules before
//! they are passed on. Lookups the rules depend on go through `next`, never
//! straight to the cluster.

pub mod backup_storage;
pub mod database_cluster;
pub mod database_engine;
pub mod engine_version;
pub mod monitoring_instance;
pub mod quantity;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use kube::ResourceExt;
use regex::Regex;
use tracing::info;
use url::Url;

use super::{
    CreateBackupStorageRequest, CreateMonitoringInstanceRequest, DeleteDatabaseClusterParams,
    Error, Handler, RequestContext, Result, UpdateBackupStorageRequest,
    UpdateMonitoringInstanceRequest, UpgradePlan, ValidationError,
};
use crate::crd::{
    BackupStorage, DatabaseCluster, DatabaseClusterBackup, DatabaseEngine, EngineType,
    MonitoringConfig,
};
use crate::kubernetes::kinds;
use database_cluster::{ValidationContext, validate_all, validate_update, validate_update_allowed};

static RFC1035_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$").ok());

/// RFC 1035 label: lowercase alphanumerics and '-', starting with a letter.
pub fn validate_rfc1035(name: &str) -> Result<(), ValidationError> {
    if RFC1035_RE.as_ref().is_some_and(|re| re.is_match(name)) {
        Ok(())
    } else {
        Err(ValidationError::InvalidName(name.to_string()))
    }
}

/// Absolute http(s) URL with a host.
pub fn validate_url(field: &'static str, value: &str) -> Result<(), ValidationError> {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(()),
        _ => Err(ValidationError::InvalidUrl { field }),
    }
}

fn validate_metadata(namespace: &str, name: &str) -> Result<(), ValidationError> {
    if namespace.is_empty() {
        return Err(ValidationError::EmptyNamespace);
    }
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    validate_rfc1035(name)
}

/// Turn NotFound into `None`.
async fn optional<T>(fut: impl Future<Output = Result<T>>) -> Result<Option<T>> {
    match fut.await {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn rejected(operation: &'static str, namespace: &str, name: &str, err: ValidationError) -> Error {
    info!(operation, namespace = %namespace, name = %name, reason = %err, "Request rejected");
    Error::InvalidRequest(err)
}

pub struct ValidationHandler {
    next: Arc<dyn Handler>,
}

impl ValidationHandler {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }

    /// Look up everything the cluster rules need, then run them.
    async fn validate_cluster(
        &self,
        ctx: &RequestContext,
        operation: &'static str,
        cluster: &DatabaseCluster,
        old_cluster: Option<&DatabaseCluster>,
    ) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let engine_type = cluster.engine_type();

        let engine = optional(self.next.get_database_engine(
            ctx,
            &namespace,
            engine_type.operator_name(),
        ))
        .await
        .map_err(|e| e.context("failed to get database engine"))?
        .ok_or_else(|| {
            let err = ValidationError::EngineNotInstalled(engine_type);
            rejected(operation, &namespace, &name, err)
        })?;

        let pitr = &cluster.spec.backup.pitr;
        let pitr_storage_name = pitr
            .backup_storage_name
            .as_deref()
            .filter(|s| pitr.enabled && !s.is_empty() && engine_type == EngineType::Pxc);
        let pitr_storage = match pitr_storage_name {
            Some(storage) => optional(self.next.get_backup_storage(ctx, &namespace, storage))
                .await
                .map_err(|e| e.context("failed to get backup storage"))?,
            None => None,
        };

        let monitoring_config_exists = match cluster.monitoring_config_name() {
            Some(config) => optional(self.next.get_monitoring_instance(ctx, &namespace, config))
                .await
                .map_err(|e| e.context("failed to get monitoring config"))?
                .is_some(),
            None => false,
        };

        let backup_history_storages: BTreeSet<String> = if engine_type == EngineType::Pxc {
            BTreeSet::new()
        } else {
            self.next
                .list_database_cluster_backups(ctx, &namespace, &name)
                .await
                .map_err(|e| e.context("failed to list database cluster backups"))?
                .into_iter()
                .map(|b| b.spec.backup_storage_name)
                .filter(|s| !s.is_empty())
                .collect()
        };

        let vctx = ValidationContext {
            cluster,
            engine: &engine,
            old_cluster,
            pitr_storage: pitr_storage.as_ref(),
            backup_history_storages,
            monitoring_config_exists,
        };
        validate_all(&vctx).map_err(|e| rejected(operation, &namespace, &name, e))
    }
}

#[async_trait]
impl Handler for ValidationHandler {
    async fn list_database_clusters(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<DatabaseCluster>> {
        self.next.list_database_clusters(ctx, namespace).await
    }

    async fn get_database_cluster(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseCluster> {
        self.next.get_database_cluster(ctx, namespace, name).await
    }

    async fn create_database_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &DatabaseCluster,
    ) -> Result<DatabaseCluster> {
        const OP: &str = "create_database_cluster";
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        validate_metadata(&namespace, &name).map_err(|e| rejected(OP, &namespace, &name, e))?;
        self.validate_cluster(ctx, OP, cluster, None).await?;

        let existing = optional(self.next.get_database_cluster(ctx, &namespace, &name)).await?;
        if existing.is_some() {
            return Err(rejected(
                OP,
                &namespace,
                &name,
                ValidationError::AlreadyExists {
                    kind: kinds::DATABASE_CLUSTER,
                    name: name.clone(),
                    namespace: namespace.clone(),
                },
            ));
        }
        self.next.create_database_cluster(ctx, cluster).await
    }

    async fn update_database_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &DatabaseCluster,
    ) -> Result<DatabaseCluster> {
        const OP: &str = "update_database_cluster";
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        validate_metadata(&namespace, &name).map_err(|e| rejected(OP, &namespace, &name, e))?;

        let current = self
            .next
            .get_database_cluster(ctx, &namespace, &name)
            .await?;
        validate_update_allowed(&current).map_err(|e| rejected(OP, &namespace, &name, e))?;
        self.validate_cluster(ctx, OP, cluster, Some(&current)).await?;
        validate_update(cluster, &current).map_err(|e| rejected(OP, &namespace, &name, e))?;
        self.next.update_database_cluster(ctx, cluster).await
    }

    async fn delete_database_cluster(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        params: &DeleteDatabaseClusterParams,
    ) -> Result<()> {
        self.next
            .delete_database_cluster(ctx, namespace, name, params)
            .await
    }

    async fn list_database_cluster_backups(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<DatabaseClusterBackup>> {
        self.next
            .list_database_cluster_backups(ctx, namespace, cluster_name)
            .await
    }

    async fn list_database_engines(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<DatabaseEngine>> {
        self.next.list_database_engines(ctx, namespace).await
    }

    async fn get_database_engine(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseEngine> {
        self.next.get_database_engine(ctx, namespace, name).await
    }

    async fn update_database_engine(
        &self,
        ctx: &RequestContext,
        engine: &DatabaseEngine,
    ) -> Result<DatabaseEngine> {
        const OP: &str = "update_database_engine";
        let namespace = engine.namespace().unwrap_or_default();
        let name = engine.name_any();
        validate_metadata(&namespace, &name).map_err(|e| rejected(OP, &namespace, &name, e))?;
        let current = self.next.get_database_engine(ctx, &namespace, &name).await?;
        database_engine::validate_update(engine, &current)
            .map_err(|e| rejected(OP, &namespace, &name, e))?;
        self.next.update_database_engine(ctx, engine).await
    }

    async fn list_backup_storages(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<BackupStorage>> {
        self.next.list_backup_storages(ctx, namespace).await
    }

    async fn get_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<BackupStorage> {
        self.next.get_backup_storage(ctx, namespace, name).await
    }

    async fn create_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        req: &CreateBackupStorageRequest,
    ) -> Result<BackupStorage> {
        const OP: &str = "create_backup_storage";
        validate_metadata(namespace, &req.name)
            .and_then(|()| backup_storage::validate_create(req))
            .map_err(|e| rejected(OP, namespace, &req.name, e))?;
        if optional(self.next.get_backup_storage(ctx, namespace, &req.name))
            .await?
            .is_some()
        {
            return Err(rejected(
                OP,
                namespace,
                &req.name,
                ValidationError::AlreadyExists {
                    kind: kinds::BACKUP_STORAGE,
                    name: req.name.clone(),
                    namespace: namespace.to_string(),
                },
            ));
        }
        self.next.create_backup_storage(ctx, namespace, req).await
    }

    async fn update_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        req: &UpdateBackupStorageRequest,
    ) -> Result<BackupStorage> {
        backup_storage::validate_update(req)
            .map_err(|e| rejected("update_backup_storage", namespace, name, e))?;
        self.next
            .update_backup_storage(ctx, namespace, name, req)
            .await
    }

    async fn delete_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let clusters = self
            .next
            .list_database_clusters(ctx, namespace)
            .await
            .map_err(|e| e.context("failed to list database clusters"))?;
        backup_storage::validate_delete(name, &clusters)
            .map_err(|e| rejected("delete_backup_storage", namespace, name, e))?;
        self.next.delete_backup_storage(ctx, namespace, name).await
    }

    async fn list_monitoring_instances(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<MonitoringConfig>> {
        self.next.list_monitoring_instances(ctx, namespace).await
    }

    async fn get_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<MonitoringConfig> {
        self.next.get_monitoring_instance(ctx, namespace, name).await
    }

    async fn create_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        req: &CreateMonitoringInstanceRequest,
    ) -> Result<MonitoringConfig> {
        const OP: &str = "create_monitoring_instance";
        validate_metadata(namespace, &req.name)
            .and_then(|()| monitoring_instance::validate_create(req))
            .map_err(|e| rejected(OP, namespace, &req.name, e))?;
        if optional(self.next.get_monitoring_instance(ctx, namespace, &req.name))
            .await?
            .is_some()
        {
            return Err(rejected(
                OP,
                namespace,
                &req.name,
                ValidationError::AlreadyExists {
                    kind: kinds::MONITORING_CONFIG,
                    name: req.name.clone(),
                    namespace: namespace.to_string(),
                },
            ));
        }
        self.next
            .create_monitoring_instance(ctx, namespace, req)
            .await
    }

    async fn update_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        req: &UpdateMonitoringInstanceRequest,
    ) -> Result<MonitoringConfig> {
        monitoring_instance::validate_update(req)
            .map_err(|e| rejected("update_monitoring_instance", namespace, name, e))?;
        self.next
            .update_monitoring_instance(ctx, namespace, name, req)
            .await
    }

    async fn delete_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        self.next
            .delete_monitoring_instance(ctx, namespace, name)
            .await
    }

    async fn get_upgrade_plan(&self, ctx: &RequestContext, namespace: &str) -> Result<UpgradePlan> {
        self.next.get_upgrade_plan(ctx, namespace).await
    }

    async fn approve_upgrade_plan(&self, ctx: &RequestContext, namespace: &str) -> Result<()> {
        self.next.approve_upgrade_plan(ctx, namespace).await
    }
}
