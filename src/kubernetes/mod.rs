//! Access to the Kubernetes API for the resources the control plane manages.
//!
//! [`KubeConnector`] is the seam the execution handler talks through;
//! [`KubeClient`] implements it with typed `kube::Api` handles.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use crate::crd::{
    BackupStorage, DatabaseCluster, DatabaseClusterBackup, DatabaseEngine, InstallPlan,
    MonitoringConfig,
};
use crate::handlers::{Error, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "dbaas-control-plane";

/// Finalizer asking the engine operator to delete a cluster's backups from
/// their storages when the cluster is deleted.
pub const STORAGE_CLEANUP_FINALIZER: &str = "everest.percona.com/dbb-storage-cleanup";

#[async_trait]
pub trait KubeConnector: Send + Sync {
    async fn list_database_engines(&self, namespace: &str) -> Result<Vec<DatabaseEngine>>;
    async fn get_database_engine(&self, namespace: &str, name: &str) -> Result<DatabaseEngine>;
    async fn update_database_engine(&self, engine: &DatabaseEngine) -> Result<DatabaseEngine>;
    /// Set or clear the upgrade lock. Returns the previous lock state.
    async fn set_database_engine_lock(
        &self,
        namespace: &str,
        name: &str,
        locked: bool,
    ) -> Result<bool>;

    async fn list_database_clusters(&self, namespace: &str) -> Result<Vec<DatabaseCluster>>;
    async fn get_database_cluster(&self, namespace: &str, name: &str) -> Result<DatabaseCluster>;
    async fn create_database_cluster(&self, cluster: &DatabaseCluster) -> Result<DatabaseCluster>;
    async fn update_database_cluster(&self, cluster: &DatabaseCluster) -> Result<DatabaseCluster>;
    async fn delete_database_cluster(
        &self,
        namespace: &str,
        name: &str,
        cleanup_backups: bool,
    ) -> Result<()>;

    async fn list_database_cluster_backups(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DatabaseClusterBackup>>;

    async fn list_backup_storages(&self, namespace: &str) -> Result<Vec<BackupStorage>>;
    async fn get_backup_storage(&self, namespace: &str, name: &str) -> Result<BackupStorage>;
    async fn create_backup_storage(&self, storage: &BackupStorage) -> Result<BackupStorage>;
    async fn update_backup_storage(&self, storage: &BackupStorage) -> Result<BackupStorage>;
    async fn delete_backup_storage(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_monitoring_configs(&self, namespace: &str) -> Result<Vec<MonitoringConfig>>;
    async fn get_monitoring_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<MonitoringConfig>;
    async fn create_monitoring_config(
        &self,
        config: &MonitoringConfig,
    ) -> Result<MonitoringConfig>;
    async fn update_monitoring_config(
        &self,
        config: &MonitoringConfig,
    ) -> Result<MonitoringConfig>;
    async fn delete_monitoring_config(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a credentials secret. Fails with 409 Conflict if it already exists.
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;
    /// Create or update a credentials secret, merging `data` into existing keys.
    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;
    /// Delete a secret. A missing secret is not an error.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Approve an OLM install plan. Returns false if it was already approved.
    async fn approve_install_plan(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// Kind names used in NotFound errors.
pub mod kinds {
    pub const DATABASE_ENGINE: &str = "database engine";
    pub const DATABASE_CLUSTER: &str = "database cluster";
    pub const BACKUP_STORAGE: &str = "backup storage";
    pub const MONITORING_CONFIG: &str = "monitoring config";
    pub const INSTALL_PLAN: &str = "install plan";
    pub const SECRET: &str = "secret";
    pub const CONFIG_MAP: &str = "config map";
}

/// Map a 404 from the API server to [`Error::NotFound`].
fn map_not_found<'a>(kind: &'static str, name: &'a str) -> impl FnOnce(kube::Error) -> Error + 'a {
    move |e| match e {
        kube::Error::Api(ref api_err) if api_err.code == 404 => Error::not_found(kind, name),
        e => Error::KubeError(e),
    }
}

fn credentials_secret(namespace: &str, name: &str, data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn list<K>(&self, namespace: &str, params: &ListParams) -> Result<Vec<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        Ok(self.api::<K>(namespace).list(params).await?.items)
    }

    async fn get<K>(&self, kind: &'static str, namespace: &str, name: &str) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(map_not_found(kind, name))
    }

    async fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = obj.namespace().unwrap_or_default();
        Ok(self
            .api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace<K>(&self, kind: &'static str, obj: &K) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(map_not_found(kind, &name))
    }

    async fn delete<K>(
        &self,
        kind: &'static str,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(namespace)
            .delete(name, params)
            .await
            .map_err(map_not_found(kind, name))?;
        Ok(())
    }

    /// Read a ConfigMap, used to load the authorization policy at startup.
    pub async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.get(kinds::CONFIG_MAP, namespace, name).await
    }
}

#[async_trait]
impl KubeConnector for KubeClient {
    async fn list_database_engines(&self, namespace: &str) -> Result<Vec<DatabaseEngine>> {
        self.list(namespace, &ListParams::default()).await
    }

    async fn get_database_engine(&self, namespace: &str, name: &str) -> Result<DatabaseEngine> {
        self.get(kinds::DATABASE_ENGINE, namespace, name).await
    }

    async fn update_database_engine(&self, engine: &DatabaseEngine) -> Result<DatabaseEngine> {
        self.replace(kinds::DATABASE_ENGINE, engine).await
    }

    async fn set_database_engine_lock(
        &self,
        namespace: &str,
        name: &str,
        locked: bool,
    ) -> Result<bool> {
        let mut engine: DatabaseEngine = self.get(kinds::DATABASE_ENGINE, namespace, name).await?;
        let was_locked = engine.is_upgrade_locked();
        if engine.set_upgrade_lock(locked) {
            // Replace carries the resourceVersion we read, so a concurrent
            // writer makes this fail with 409 instead of being overwritten.
            self.replace(kinds::DATABASE_ENGINE, &engine).await?;
            debug!(namespace = %namespace, name = %name, locked, "Updated engine upgrade lock");
        }
        Ok(was_locked)
    }

    async fn list_database_clusters(&self, namespace: &str) -> Result<Vec<DatabaseCluster>> {
        self.list(namespace, &ListParams::default()).await
    }

    async fn get_database_cluster(&self, namespace: &str, name: &str) -> Result<DatabaseCluster> {
        self.get(kinds::DATABASE_CLUSTER, namespace, name).await
    }

    async fn create_database_cluster(&self, cluster: &DatabaseCluster) -> Result<DatabaseCluster> {
        self.create(cluster).await
    }

    async fn update_database_cluster(&self, cluster: &DatabaseCluster) -> Result<DatabaseCluster> {
        self.replace(kinds::DATABASE_CLUSTER, cluster).await
    }

    async fn delete_database_cluster(
        &self,
        namespace: &str,
        name: &str,
        cleanup_backups: bool,
    ) -> Result<()> {
        let api: Api<DatabaseCluster> = self.api(namespace);
        let params = if cleanup_backups {
            let cluster = api
                .get(name)
                .await
                .map_err(map_not_found(kinds::DATABASE_CLUSTER, name))?;
            if !cluster.finalizers().iter().any(|f| f == STORAGE_CLEANUP_FINALIZER) {
                let mut finalizers = cluster.finalizers().to_vec();
                finalizers.push(STORAGE_CLEANUP_FINALIZER.to_string());
                let patch = json!({ "metadata": { "finalizers": finalizers } });
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
            }
            DeleteParams::foreground()
        } else {
            DeleteParams::background()
        };
        self.delete::<DatabaseCluster>(kinds::DATABASE_CLUSTER, namespace, name, &params)
            .await?;
        info!(namespace = %namespace, name = %name, cleanup_backups, "Deleted database cluster");
        Ok(())
    }

    async fn list_database_cluster_backups(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DatabaseClusterBackup>> {
        self.list(namespace, &ListParams::default().labels(label_selector))
            .await
    }

    async fn list_backup_storages(&self, namespace: &str) -> Result<Vec<BackupStorage>> {
        self.list(namespace, &ListParams::default()).await
    }

    async fn get_backup_storage(&self, namespace: &str, name: &str) -> Result<BackupStorage> {
        self.get(kinds::BACKUP_STORAGE, namespace, name).await
    }

    async fn create_backup_storage(&self, storage: &BackupStorage) -> Result<BackupStorage> {
        self.create(storage).await
    }

    async fn update_backup_storage(&self, storage: &BackupStorage) -> Result<BackupStorage> {
        self.replace(kinds::BACKUP_STORAGE, storage).await
    }

    async fn delete_backup_storage(&self, namespace: &str, name: &str) -> Result<()> {
        let params = DeleteParams::default();
        self.delete::<BackupStorage>(kinds::BACKUP_STORAGE, namespace, name, &params)
            .await
    }

    async fn list_monitoring_configs(&self, namespace: &str) -> Result<Vec<MonitoringConfig>> {
        self.list(namespace, &ListParams::default()).await
    }

    async fn get_monitoring_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<MonitoringConfig> {
        self.get(kinds::MONITORING_CONFIG, namespace, name).await
    }

    async fn create_monitoring_config(
        &self,
        config: &MonitoringConfig,
    ) -> Result<MonitoringConfig> {
        self.create(config).await
    }

    async fn update_monitoring_config(
        &self,
        config: &MonitoringConfig,
    ) -> Result<MonitoringConfig> {
        self.replace(kinds::MONITORING_CONFIG, config).await
    }

    async fn delete_monitoring_config(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<MonitoringConfig>(
            kinds::MONITORING_CONFIG,
            namespace,
            name,
            &DeleteParams::default(),
        )
        .await
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Secret> = self.api(namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, &credentials_secret(namespace, name, data)).await?;
        debug!(namespace = %namespace, name = %name, "Created credentials secret");
        Ok(())
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Secret> = self.api(namespace);
        let secret = credentials_secret(namespace, name, data);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&secret)).await?;
        debug!(namespace = %namespace, name = %name, "Applied credentials secret");
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .delete::<Secret>(kinds::SECRET, namespace, name, &DeleteParams::default())
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            res => res,
        }
    }

    async fn approve_install_plan(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<InstallPlan> = self.api(namespace);
        let plan = api
            .get(name)
            .await
            .map_err(map_not_found(kinds::INSTALL_PLAN, name))?;
        if plan.spec.approved {
            return Ok(false);
        }
        let patch = json!({ "spec": { "approved": true } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_not_found(kinds::INSTALL_PLAN, name))?;
        info!(namespace = %namespace, name = %name, "Approved install plan");
        Ok(true)
    }
}
