//! Execution layer: the end of the pipeline, backed by Kubernetes.

pub mod retry;
pub mod upgrade;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::{
    CreateBackupStorageRequest, CreateMonitoringInstanceRequest, DeleteDatabaseClusterParams,
    Handler, PmmCredentials, RequestContext, Result, UpdateBackupStorageRequest,
    UpdateMonitoringInstanceRequest, UpgradePlan,
};
use crate::crd::{
    BackupStorage, BackupStorageSpec, BackupStorageType, CLUSTER_NAME_LABEL, DatabaseCluster,
    DatabaseClusterBackup, DatabaseEngine, MonitoringConfig, MonitoringConfigSpec,
    MonitoringType, PmmConfig,
};
use crate::kubernetes::KubeConnector;
use crate::version_service::VersionService;
pub use retry::RetryPolicy;
use upgrade::{UpgradeApproval, UpgradeSteps};

fn storage_secret_data(
    storage_type: BackupStorageType,
    access_key: &str,
    secret_key: &str,
) -> BTreeMap<String, String> {
    let (access_field, secret_field) = storage_type.credential_keys();
    BTreeMap::from([
        (access_field.to_string(), access_key.to_string()),
        (secret_field.to_string(), secret_key.to_string()),
    ])
}

fn pmm_secret_data(pmm: &PmmCredentials) -> BTreeMap<String, String> {
    if pmm.api_key.is_empty() {
        BTreeMap::from([
            ("username".to_string(), pmm.user.clone()),
            ("password".to_string(), pmm.password.clone()),
        ])
    } else {
        BTreeMap::from([("apiKey".to_string(), pmm.api_key.clone())])
    }
}

fn object_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Carry the stored resourceVersion over so that a replace is checked
/// against the object the client last saw.
fn with_resource_version<K: Resource + Clone>(obj: &K, current: &K) -> K {
    let mut obj = obj.clone();
    if obj.meta().resource_version.is_none() {
        obj.meta_mut().resource_version = current.meta().resource_version.clone();
    }
    obj
}

pub struct ExecutionHandler {
    kube: Arc<dyn KubeConnector>,
    versions: Arc<dyn VersionService>,
    retry: RetryPolicy,
}

impl ExecutionHandler {
    pub fn new(kube: Arc<dyn KubeConnector>, versions: Arc<dyn VersionService>) -> Self {
        Self {
            kube,
            versions,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn set_engine_lock(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        locked: bool,
    ) -> Result<bool> {
        self.retry
            .retry(ctx, "set_database_engine_lock", move || {
                self.kube.set_database_engine_lock(namespace, name, locked)
            })
            .await
    }
}

#[async_trait]
impl UpgradeSteps for ExecutionHandler {
    async fn lock_engine(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<bool> {
        self.set_engine_lock(ctx, namespace, name, true).await
    }

    async fn unlock_engine(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        self.set_engine_lock(ctx, namespace, name, false)
            .await
            .map(|_| ())
    }

    async fn approve_pending_install_plans(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<()> {
        let engines = self
            .retry
            .retry(ctx, "list_database_engines", move || {
                self.kube.list_database_engines(namespace)
            })
            .await?;
        for plan in upgrade::install_plans_to_approve(&engines) {
            let name = plan.as_str();
            let approved = self
                .retry
                .retry(ctx, "approve_install_plan", move || {
                    self.kube.approve_install_plan(namespace, name)
                })
                .await
                .map_err(|e| e.context(format!("failed to approve install plan '{plan}'")))?;
            if !approved {
                debug!(namespace = %namespace, install_plan = %plan, "Already approved");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for ExecutionHandler {
    async fn list_database_clusters(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<DatabaseCluster>> {
        ctx.run(self.kube.list_database_clusters(namespace)).await
    }

    async fn get_database_cluster(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseCluster> {
        ctx.run(self.kube.get_database_cluster(namespace, name))
            .await
    }

    async fn create_database_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &DatabaseCluster,
    ) -> Result<DatabaseCluster> {
        let created = ctx
            .run(self.kube.create_database_cluster(cluster))
            .await?;
        info!(
            namespace = %created.namespace().unwrap_or_default(),
            name = %created.name_any(),
            engine = %created.engine_type(),
            "Created database cluster"
        );
        Ok(created)
    }

    async fn update_database_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &DatabaseCluster,
    ) -> Result<DatabaseCluster> {
        let namespace = cluster.namespace().unwrap_or_default();
        let current = ctx
            .run(self.kube.get_database_cluster(&namespace, &cluster.name_any()))
            .await?;
        let updated = ctx
            .run(
                self.kube
                    .update_database_cluster(&with_resource_version(cluster, &current)),
            )
            .await?;
        info!(namespace = %namespace, name = %updated.name_any(), "Updated database cluster");
        Ok(updated)
    }

    async fn delete_database_cluster(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        params: &DeleteDatabaseClusterParams,
    ) -> Result<()> {
        ctx.run(
            self.kube
                .delete_database_cluster(namespace, name, params.cleanup()),
        )
        .await?;
        info!(
            namespace = %namespace,
            name = %name,
            cleanup_backup_storage = params.cleanup(),
            "Deleted database cluster"
        );
        Ok(())
    }

    async fn list_database_cluster_backups(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<DatabaseClusterBackup>> {
        let selector = format!("{CLUSTER_NAME_LABEL}={cluster_name}");
        ctx.run(self.kube.list_database_cluster_backups(namespace, &selector))
            .await
    }

    async fn list_database_engines(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<DatabaseEngine>> {
        ctx.run(self.kube.list_database_engines(namespace)).await
    }

    async fn get_database_engine(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseEngine> {
        ctx.run(self.kube.get_database_engine(namespace, name))
            .await
    }

    async fn update_database_engine(
        &self,
        ctx: &RequestContext,
        engine: &DatabaseEngine,
    ) -> Result<DatabaseEngine> {
        let namespace = engine.namespace().unwrap_or_default();
        let current = ctx
            .run(self.kube.get_database_engine(&namespace, &engine.name_any()))
            .await?;
        ctx.run(
            self.kube
                .update_database_engine(&with_resource_version(engine, &current)),
        )
        .await
    }

    async fn list_backup_storages(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<BackupStorage>> {
        ctx.run(self.kube.list_backup_storages(namespace)).await
    }

    async fn get_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<BackupStorage> {
        ctx.run(self.kube.get_backup_storage(namespace, name)).await
    }

    async fn create_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        req: &CreateBackupStorageRequest,
    ) -> Result<BackupStorage> {
        let secret_name = BackupStorage::secret_name_for(&req.name);
        let secret = storage_secret_data(req.storage_type, &req.access_key, &req.secret_key);
        ctx.run(self.kube.create_secret(namespace, &secret_name, secret))
            .await
            .map_err(|e| e.context("failed to store backup storage credentials"))?;

        let storage = BackupStorage {
            metadata: object_meta(namespace, &req.name),
            spec: BackupStorageSpec {
                storage_type: req.storage_type,
                bucket: req.bucket_name.clone(),
                region: req.region.clone(),
                endpoint_url: req.url.clone().unwrap_or_default(),
                description: req.description.clone().unwrap_or_default(),
                credentials_secret_name: secret_name.clone(),
                verify_tls: req.verify_tls,
                force_path_style: req.force_path_style,
            },
        };
        match ctx.run(self.kube.create_backup_storage(&storage)).await {
            Ok(created) => {
                info!(namespace = %namespace, name = %req.name, "Created backup storage");
                Ok(created)
            }
            Err(e) => {
                if let Err(cleanup) = self.kube.delete_secret(namespace, &secret_name).await {
                    warn!(
                        namespace = %namespace,
                        name = %req.name,
                        error = %cleanup,
                        "Failed to remove credentials of unsaved backup storage"
                    );
                }
                Err(e)
            }
        }
    }

    async fn update_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        req: &UpdateBackupStorageRequest,
    ) -> Result<BackupStorage> {
        let mut storage = ctx.run(self.kube.get_backup_storage(namespace, name)).await?;

        if let (Some(access_key), Some(secret_key)) = (&req.access_key, &req.secret_key) {
            let secret = storage_secret_data(storage.spec.storage_type, access_key, secret_key);
            let secret_name = storage.spec.credentials_secret_name.clone();
            ctx.run(self.kube.apply_secret(namespace, &secret_name, secret))
                .await
                .map_err(|e| e.context("failed to update backup storage credentials"))?;
        }

        let spec = &mut storage.spec;
        if let Some(bucket) = &req.bucket_name {
            spec.bucket.clone_from(bucket);
        }
        if let Some(region) = &req.region {
            spec.region.clone_from(region);
        }
        if let Some(url) = &req.url {
            spec.endpoint_url.clone_from(url);
        }
        if let Some(description) = &req.description {
            spec.description.clone_from(description);
        }
        if req.verify_tls.is_some() {
            spec.verify_tls = req.verify_tls;
        }
        if req.force_path_style.is_some() {
            spec.force_path_style = req.force_path_style;
        }

        let updated = ctx.run(self.kube.update_backup_storage(&storage)).await?;
        info!(namespace = %namespace, name = %name, "Updated backup storage");
        Ok(updated)
    }

    async fn delete_backup_storage(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let storage = ctx.run(self.kube.get_backup_storage(namespace, name)).await?;
        ctx.run(self.kube.delete_backup_storage(namespace, name))
            .await?;
        ctx.run(
            self.kube
                .delete_secret(namespace, &storage.spec.credentials_secret_name),
        )
        .await
        .map_err(|e| e.context("failed to delete backup storage credentials"))?;
        info!(namespace = %namespace, name = %name, "Deleted backup storage");
        Ok(())
    }

    async fn list_monitoring_instances(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<Vec<MonitoringConfig>> {
        ctx.run(self.kube.list_monitoring_configs(namespace)).await
    }

    async fn get_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<MonitoringConfig> {
        ctx.run(self.kube.get_monitoring_config(namespace, name))
            .await
    }

    async fn create_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        req: &CreateMonitoringInstanceRequest,
    ) -> Result<MonitoringConfig> {
        let secret_name = MonitoringConfig::secret_name_for(&req.name);
        if let Some(pmm) = &req.pmm {
            ctx.run(self.kube.create_secret(namespace, &secret_name, pmm_secret_data(pmm)))
                .await
                .map_err(|e| e.context("failed to store monitoring credentials"))?;
        }

        let config = MonitoringConfig {
            metadata: object_meta(namespace, &req.name),
            spec: MonitoringConfigSpec {
                monitoring_type: MonitoringType::Pmm,
                pmm: PmmConfig {
                    url: req.url.clone(),
                    image: String::new(),
                },
                credentials_secret_name: secret_name.clone(),
                verify_tls: req.verify_tls,
            },
        };
        match ctx.run(self.kube.create_monitoring_config(&config)).await {
            Ok(created) => {
                info!(namespace = %namespace, name = %req.name, "Created monitoring instance");
                Ok(created)
            }
            Err(e) => {
                if let Err(cleanup) = self.kube.delete_secret(namespace, &secret_name).await {
                    warn!(
                        namespace = %namespace,
                        name = %req.name,
                        error = %cleanup,
                        "Failed to remove credentials of unsaved monitoring instance"
                    );
                }
                Err(e)
            }
        }
    }

    async fn update_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
        req: &UpdateMonitoringInstanceRequest,
    ) -> Result<MonitoringConfig> {
        let mut config = ctx
            .run(self.kube.get_monitoring_config(namespace, name))
            .await?;

        if let Some(pmm) = &req.pmm {
            let secret_name = config.spec.credentials_secret_name.clone();
            ctx.run(self.kube.apply_secret(namespace, &secret_name, pmm_secret_data(pmm)))
                .await
                .map_err(|e| e.context("failed to update monitoring credentials"))?;
        }
        if !req.url.is_empty() {
            config.spec.pmm.url.clone_from(&req.url);
        }
        if req.verify_tls.is_some() {
            config.spec.verify_tls = req.verify_tls;
        }

        let updated = ctx
            .run(self.kube.update_monitoring_config(&config))
            .await?;
        info!(namespace = %namespace, name = %name, "Updated monitoring instance");
        Ok(updated)
    }

    async fn delete_monitoring_instance(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let config = ctx
            .run(self.kube.get_monitoring_config(namespace, name))
            .await?;
        ctx.run(self.kube.delete_monitoring_config(namespace, name))
            .await?;
        ctx.run(
            self.kube
                .delete_secret(namespace, &config.spec.credentials_secret_name),
        )
        .await
        .map_err(|e| e.context("failed to delete monitoring credentials"))?;
        info!(namespace = %namespace, name = %name, "Deleted monitoring instance");
        Ok(())
    }

    async fn get_upgrade_plan(&self, ctx: &RequestContext, namespace: &str) -> Result<UpgradePlan> {
        let mut plan = upgrade::compute_upgrade_plan(
            ctx,
            self.kube.as_ref(),
            self.versions.as_ref(),
            namespace,
        )
        .await
        .map_err(|e| e.context("failed to compute upgrade plan"))?;
        if plan.upgrades.is_empty() {
            plan.pending_actions =
                upgrade::compute_post_upgrade_tasks(ctx, self.kube.as_ref(), namespace).await?;
        }
        Ok(plan)
    }

    async fn approve_upgrade_plan(&self, ctx: &RequestContext, namespace: &str) -> Result<()> {
        let plan = upgrade::compute_upgrade_plan(
            ctx,
            self.kube.as_ref(),
            self.versions.as_ref(),
            namespace,
        )
        .await
        .map_err(|e| e.context("failed to compute upgrade plan"))?;
        if plan.upgrades.is_empty() {
            info!(namespace = %namespace, "No operator upgrades to approve");
            return Ok(());
        }
        UpgradeApproval::new(self, namespace)
            .run(ctx, &plan)
            .await
            .map(|_| ())
    }
}
