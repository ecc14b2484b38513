//! Authorization layer of the pipeline.
//!
//! Single-item operations are checked before delegating; list operations are
//! delegated first and filtered down to what the user may read.

pub mod policy;
pub mod reload;

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::{
    CreateBackupStorageRequest, CreateMonitoringInstanceRequest, DeleteDatabaseClusterParams,
    Error, Handler, RequestContext, Result, UpdateBackupStorageRequest,
    UpdateMonitoringInstanceRequest, UpgradePlan,
};
use crate::crd::{
    BackupStorage, DatabaseCluster, DatabaseClusterBackup, DatabaseEngine, MonitoringConfig,
};
pub use policy::{Enforcer, Policy};
pub use reload::{PolicySource, ReloadingPolicy};

/// Resource types named in policies
pub mod resources {
    pub const DATABASE_CLUSTERS: &str = "database-clusters";
    pub const DATABASE_CLUSTER_BACKUPS: &str = "database-cluster-backups";
    pub const DATABASE_ENGINES: &str = "database-engines";
    pub const BACKUP_STORAGES: &str = "backup-storages";
    pub const MONITORING_INSTANCES: &str = "monitoring-instances";
}

/// Actions named in policies
pub mod actions {
    pub const READ: &str = "read";
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
}

use actions::*;
use resources::*;

/// Resolves the user a request is made on behalf of.
pub type UserGetter = Arc<dyn Fn(&RequestContext) -> Result<String> + Send + Sync>;

/// Takes the user from the request context.
pub fn user_from_context() -> UserGetter {
    Arc::new(|ctx: &RequestContext| {
        ctx.user()
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .ok_or(Error::InsufficientPermissions)
    })
}

/// Policy object path for a namespaced resource.
pub fn object_path(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

pub struct RbacHandler {
    next: Arc<dyn Handler>,
    enforcer: Arc<dyn Enforcer>,
    user_getter: UserGetter,
}

impl RbacHandler {
    pub fn new(
        next: Arc<dyn Handler>,
        enforcer: Arc<dyn Enforcer>,
        user_getter: UserGetter,
    ) -> Self {
        Self {
            next,
            enforcer,
            user_getter,
        }
    }

    fn user(&self, ctx: &RequestContext) -> Result<String> {
        (self.user_getter)(ctx).map_err(|e| {
            warn!(error = %e, "Cannot resolve request user");
            Error::InsufficientPermissions
        })
    }

    fn allowed(&self, user: &str, resource: &str, action: &str, object: &str) -> Result<bool> {
        self.enforcer.enforce(user, resource, action, object)
    }

    fn enforce(
        &self,
        ctx: &RequestContext,
        resource: &str,
        action: &str,
        object: &str,
    ) -> Result<()> {
        let user = self.user(ctx)?;
        if self.allowed(&user, resource, action, object)? {
            return Ok(());
        }
        warn!(user = %user, resource, action, object, "Permission denied");
        Err(Error::InsufficientPermissions)
    }

    /// Keep only the items the user may read. Order is preserved.
    fn filter_readable<K: ResourceExt>(
        &self,
        ctx: &RequestContext,
        resource: &str,
        namespace: &str,
        items: Vec<K>,
    ) -> Result<Vec<K>> {
        let user = self.user(ctx)?;
        let total = items.len();
        let mut visible = Vec::with_capacity(total);
        for item in items {
            if self.allowed(&user, resource, READ, &object_path(namespace, &item.name_any()))? {
                visible.push(item);
            }
        }
        debug!(user = %user, resource, total, visible = visible.len(), "Filtered list result");
        Ok(visible)
    }

    /// Read access to every storage and monitoring config a cluster refers to.
    fn enforce_cluster_references(
        &self,
        ctx: &RequestContext,
        cluster: &DatabaseCluster,
    ) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        for storage in cluster.referenced_backup_storages() {
            self.enforce(ctx, BACKUP_STORAGES, READ, &object_path(&namespace, &storage))?;
        }
        if let Some(monitoring) = cluster.monitoring_config_name() {
            self.enforce(ctx, MONITORING_INSTANCES, READ, &object_path(&namespace, monitoring))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for RbacHandler {
    async fn list_database_clusters(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<DatabaseCluster>> {
        let items = self.next.list_database_clusters(ctx, namespace).await?;
        self.filter_readable(ctx, DATABASE_CLUSTERS, namespace, items)
    }

    async fn get_database_cluster(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseCluster> {
        self.enforce(ctx, DATABASE_CLUSTERS, READ, &object_path(namespace, name))?;
        self.next.get_database_cluster(ctx, namespace, name).await
    }

    async fn create_database_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &DatabaseCluster,
    ) -> Result<DatabaseCluster> {
        let namespace = cluster.namespace().unwrap_or_default();
        let object = object_path(&namespace, &cluster.name_any());
        self.enforce(ctx, DATABASE_CLUSTERS, CREATE, &object)?;
        self.enforce_cluster_references(ctx, cluster)?;
        self.next.create_database_cluster(ctx, cluster).await
    }

    async fn update_database_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &DatabaseCluster,
    ) -> Result<DatabaseCluster> {
        let namespace = cluster.namespace().unwrap_or_default();
        let object = object_path(&namespace, &cluster.name_any());
        self.enforce(ctx, DATABASE_CLUSTERS, UPDATE, &object)?;
        self.enforce_cluster_references(ctx, cluster)?;
        self.next.update_database_cluster(ctx, cluster).await
    }

    async fn delete_database_cluster(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        params: &DeleteDatabaseClusterParams,
    ) -> Result<()> {
        self.enforce(ctx, DATABASE_CLUSTERS, DELETE, &object_path(namespace, name))?;
        self.next.delete_database_cluster(ctx, namespace, name, params).await
    }

    async fn list_database_cluster_backups(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<DatabaseClusterBackup>> {
        self.enforce(ctx, DATABASE_CLUSTERS, READ, &object_path(namespace, cluster_name))?;
        let items = self.next.list_database_cluster_backups(ctx, namespace, cluster_name).await?;
        self.filter_readable(ctx, DATABASE_CLUSTER_BACKUPS, namespace, items)
    }

    async fn list_database_engines(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<DatabaseEngine>> {
        let items = self.next.list_database_engines(ctx, namespace).await?;
        self.filter_readable(ctx, DATABASE_ENGINES, namespace, items)
    }

    async fn get_database_engine(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseEngine> {
        self.enforce(ctx, DATABASE_ENGINES, READ, &object_path(namespace, name))?;
        self.next.get_database_engine(ctx, namespace, name).await
    }

    async fn update_database_engine(
        &self,
        ctx: &RequestContext,
        engine: &DatabaseEngine,
    ) -> Result<DatabaseEngine> {
        let namespace = engine.namespace().unwrap_or_default();
        self.enforce(ctx, DATABASE_ENGINES, UPDATE, &object_path(&namespace, &engine.name_any()))?;
        self.next.update_database_engine(ctx, engine).await
    }

    async fn list_backup_storages(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<BackupStorage>> {
        let items = self.next.list_backup_storages(ctx, namespace).await?;
        self.filter_readable(ctx, BACKUP_STORAGES, namespace, items)
    }

    async fn get_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<BackupStorage> {
        self.enforce(ctx, BACKUP_STORAGES, READ, &object_path(namespace, name))?;
        self.next.get_backup_storage(ctx, namespace, name).await
    }

    async fn create_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        req: &CreateBackupStorageRequest,
    ) -> Result<BackupStorage> {
        self.enforce(ctx, BACKUP_STORAGES, CREATE, &object_path(namespace, &req.name))?;
        self.next.create_backup_storage(ctx, namespace, req).await
    }

    async fn update_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        req: &UpdateBackupStorageRequest,
    ) -> Result<BackupStorage> {
        self.enforce(ctx, BACKUP_STORAGES, UPDATE, &object_path(namespace, name))?;
        self.next.update_backup_storage(ctx, namespace, name, req).await
    }

    async fn delete_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        self.enforce(ctx, BACKUP_STORAGES, DELETE, &object_path(namespace, name))?;
        self.next.delete_backup_storage(ctx, namespace, name).await
    }

    async fn list_monitoring_instances(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<MonitoringConfig>> {
        let items = self.next.list_monitoring_instances(ctx, namespace).await?;
        self.filter_readable(ctx, MONITORING_INSTANCES, namespace, items)
    }

    async fn get_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<MonitoringConfig> {
        self.enforce(ctx, MONITORING_INSTANCES, READ, &object_path(namespace, name))?;
        self.next.get_monitoring_instance(ctx, namespace, name).await
    }

    async fn create_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        req: &CreateMonitoringInstanceRequest,
    ) -> Result<MonitoringConfig> {
        self.enforce(ctx, MONITORING_INSTANCES, CREATE, &object_path(namespace, &req.name))?;
        self.next.create_monitoring_instance(ctx, namespace, req).await
    }

    async fn update_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        req: &UpdateMonitoringInstanceRequest,
    ) -> Result<MonitoringConfig> {
        self.enforce(ctx, MONITORING_INSTANCES, UPDATE, &object_path(namespace, name))?;
        self.next.update_monitoring_instance(ctx, namespace, name, req).await
    }

    async fn delete_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        self.enforce(ctx, MONITORING_INSTANCES, DELETE, &object_path(namespace, name))?;
        self.next.delete_monitoring_instance(ctx, namespace, name).await
    }

    async fn get_upgrade_plan(&self, ctx: &RequestContext, namespace: &str) -> Result<UpgradePlan> {
        self.enforce(ctx, DATABASE_ENGINES, READ, &object_path(namespace, "*"))?;
        let mut plan = self.next.get_upgrade_plan(ctx, namespace).await?;

        let user = self.user(ctx)?;
        let mut pending = Vec::with_capacity(plan.pending_actions.len());
        for task in plan.pending_actions {
            if self.allowed(&user, DATABASE_CLUSTERS, READ, &object_path(namespace, &task.name))? {
                pending.push(task);
            }
        }
        plan.pending_actions = pending;
        Ok(plan)
    }

    async fn approve_upgrade_plan(&self, ctx: &RequestContext, namespace: &str) -> Result<()> {
        self.enforce(ctx, DATABASE_ENGINES, UPDATE, &object_path(namespace, "*"))?;
        self.next.approve_upgrade_plan(ctx, namespace).await
    }
}
