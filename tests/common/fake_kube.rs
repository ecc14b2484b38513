//! In-memory stand-ins for the Kubernetes API and the version service
//!
//! [`FakeKube`] stores every resource in a map keyed by namespace and name and
//! mimics the API server closely enough for the pipeline: resourceVersions
//! are bumped on every write and a stale replace fails with 409 Conflict.
//! Failures can be queued per operation with [`FakeKube::fail_next`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dbaas_control_plane::crd::{
    BackupStorage, DatabaseCluster, DatabaseClusterBackup, DatabaseEngine, EngineType,
    MonitoringConfig,
};
use dbaas_control_plane::handlers::{Error, Result};
use dbaas_control_plane::kubernetes::{KubeConnector, kinds};
use dbaas_control_plane::version_service::VersionService;
use kube::{Resource, ResourceExt};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Kinds of API failure that can be injected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Conflict,
    Unavailable,
    Forbidden,
    NotFound,
}

impl Failure {
    pub fn into_error(self) -> Error {
        let (code, reason) = match self {
            Failure::Conflict => (409, "Conflict"),
            Failure::Unavailable => (503, "ServiceUnavailable"),
            Failure::Forbidden => (403, "Forbidden"),
            Failure::NotFound => (404, "NotFound"),
        };
        Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("injected {reason}"),
            reason: reason.to_string(),
            code,
        }))
    }
}

#[derive(Default)]
struct State {
    engines: BTreeMap<Key, DatabaseEngine>,
    clusters: BTreeMap<Key, DatabaseCluster>,
    backups: BTreeMap<Key, DatabaseClusterBackup>,
    storages: BTreeMap<Key, BackupStorage>,
    monitoring: BTreeMap<Key, MonitoringConfig>,
    secrets: BTreeMap<Key, BTreeMap<String, String>>,
    /// install plan -> approved
    install_plans: BTreeMap<Key, bool>,
    failures: HashMap<&'static str, VecDeque<Failure>>,
    target_failures: HashMap<(&'static str, String), Failure>,
    calls: Vec<String>,
    resource_version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    /// Record the call and pop an injected failure for it, if any.
    fn enter(&mut self, operation: &'static str, target: &str) -> Result<()> {
        self.calls.push(format!("{operation} {target}"));
        if let Some(failure) = self.target_failures.remove(&(operation, target.to_string())) {
            return Err(failure.into_error());
        }
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }
}

fn list_in<K: Clone>(map: &BTreeMap<Key, K>, namespace: &str) -> Vec<K> {
    map.iter()
        .filter(|((ns, _), _)| ns == namespace)
        .map(|(_, v)| v.clone())
        .collect()
}

fn get_in<K: Clone>(
    map: &BTreeMap<Key, K>,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> Result<K> {
    map.get(&key(namespace, name))
        .cloned()
        .ok_or_else(|| Error::not_found(kind, name))
}

fn create_in<K: Resource + Clone>(
    map: &mut BTreeMap<Key, K>,
    version: String,
    obj: &K,
) -> Result<K> {
    let k = key(
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    );
    if map.contains_key(&k) {
        return Err(Failure::Conflict.into_error());
    }
    let mut obj = obj.clone();
    obj.meta_mut().resource_version = Some(version);
    map.insert(k, obj.clone());
    Ok(obj)
}

fn replace_in<K: Resource + Clone>(
    map: &mut BTreeMap<Key, K>,
    kind: &'static str,
    version: String,
    obj: &K,
) -> Result<K> {
    let name = obj.meta().name.clone().unwrap_or_default();
    let k = key(obj.meta().namespace.as_deref().unwrap_or_default(), &name);
    let current = map.get(&k).ok_or_else(|| Error::not_found(kind, &name))?;
    if let Some(expected) = obj.meta().resource_version.as_deref()
        && current.meta().resource_version.as_deref() != Some(expected)
    {
        return Err(Failure::Conflict.into_error());
    }
    let mut obj = obj.clone();
    obj.meta_mut().resource_version = Some(version);
    map.insert(k, obj.clone());
    Ok(obj)
}

fn delete_in<K>(
    map: &mut BTreeMap<Key, K>,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> Result<()> {
    map.remove(&key(namespace, name))
        .map(|_| ())
        .ok_or_else(|| Error::not_found(kind, name))
}

#[derive(Default)]
pub struct FakeKube {
    state: Mutex<State>,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_engine(self, engine: DatabaseEngine) -> Self {
        self.insert_engine(engine);
        self
    }

    pub fn with_cluster(self, cluster: DatabaseCluster) -> Self {
        self.insert_cluster(cluster);
        self
    }

    pub fn with_backup_storage(self, storage: BackupStorage) -> Self {
        {
            let mut state = self.state();
            let version = state.next_version();
            create_in(&mut state.storages, version, &storage).unwrap();
        }
        self
    }

    pub fn with_secret(self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state().secrets.insert(key(namespace, name), data);
        self
    }

    pub fn with_monitoring_config(self, config: MonitoringConfig) -> Self {
        {
            let mut state = self.state();
            let version = state.next_version();
            create_in(&mut state.monitoring, version, &config).unwrap();
        }
        self
    }

    pub fn with_backup(self, backup: DatabaseClusterBackup) -> Self {
        {
            let mut state = self.state();
            let version = state.next_version();
            create_in(&mut state.backups, version, &backup).unwrap();
        }
        self
    }

    /// Register an OLM install plan, approved or not.
    pub fn with_install_plan(self, namespace: &str, name: &str, approved: bool) -> Self {
        self.state().install_plans.insert(key(namespace, name), approved);
        self
    }

    pub fn insert_engine(&self, engine: DatabaseEngine) {
        let mut state = self.state();
        let version = state.next_version();
        create_in(&mut state.engines, version, &engine).unwrap();
    }

    pub fn insert_cluster(&self, cluster: DatabaseCluster) {
        let mut state = self.state();
        let version = state.next_version();
        create_in(&mut state.clusters, version, &cluster).unwrap();
    }

    /// Fail the next call of `operation`: a `KubeConnector` method name, or
    /// `lock_engine` / `unlock_engine` for lock changes.
    pub fn fail_next(&self, operation: &'static str, failure: Failure) {
        self.fail_times(operation, failure, 1);
    }

    pub fn fail_times(&self, operation: &'static str, failure: Failure, times: usize) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .extend(std::iter::repeat_n(failure, times));
    }

    /// Fail the next call of `operation` on `target` only.
    pub fn fail_next_on(&self, operation: &'static str, target: &str, failure: Failure) {
        self.state()
            .target_failures
            .insert((operation, target.to_string()), failure);
    }

    /// Every call made so far, as "operation target".
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.split_once(' ').is_some_and(|(op, _)| op == operation))
            .count()
    }

    pub fn engine(&self, namespace: &str, name: &str) -> Option<DatabaseEngine> {
        self.state().engines.get(&key(namespace, name)).cloned()
    }

    /// Lock flag of every engine in the namespace, by name.
    pub fn engine_locks(&self, namespace: &str) -> BTreeMap<String, bool> {
        self.state()
            .engines
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, name), e)| (name.clone(), e.is_upgrade_locked()))
            .collect()
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<DatabaseCluster> {
        self.state().clusters.get(&key(namespace, name)).cloned()
    }

    pub fn backup_storage(&self, namespace: &str, name: &str) -> Option<BackupStorage> {
        self.state().storages.get(&key(namespace, name)).cloned()
    }

    pub fn monitoring_config(&self, namespace: &str, name: &str) -> Option<MonitoringConfig> {
        self.state().monitoring.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.state().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn install_plan_approved(&self, namespace: &str, name: &str) -> Option<bool> {
        self.state().install_plans.get(&key(namespace, name)).copied()
    }
}

#[async_trait]
impl KubeConnector for FakeKube {
    async fn list_database_engines(&self, namespace: &str) -> Result<Vec<DatabaseEngine>> {
        let mut state = self.state();
        state.enter("list_database_engines", namespace)?;
        Ok(list_in(&state.engines, namespace))
    }

    async fn get_database_engine(&self, namespace: &str, name: &str) -> Result<DatabaseEngine> {
        let mut state = self.state();
        state.enter("get_database_engine", name)?;
        get_in(&state.engines, kinds::DATABASE_ENGINE, namespace, name)
    }

    async fn update_database_engine(&self, engine: &DatabaseEngine) -> Result<DatabaseEngine> {
        let mut state = self.state();
        state.enter("update_database_engine", &engine.name_any())?;
        let version = state.next_version();
        replace_in(&mut state.engines, kinds::DATABASE_ENGINE, version, engine)
    }

    async fn set_database_engine_lock(
        &self,
        namespace: &str,
        name: &str,
        locked: bool,
    ) -> Result<bool> {
        let mut state = self.state();
        let operation = if locked { "lock_engine" } else { "unlock_engine" };
        state.enter(operation, name)?;
        let version = state.next_version();
        let engine = state
            .engines
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::not_found(kinds::DATABASE_ENGINE, name))?;
        let was_locked = engine.is_upgrade_locked();
        if engine.set_upgrade_lock(locked) {
            engine.metadata.resource_version = Some(version);
        }
        Ok(was_locked)
    }

    async fn list_database_clusters(&self, namespace: &str) -> Result<Vec<DatabaseCluster>> {
        let mut state = self.state();
        state.enter("list_database_clusters", namespace)?;
        Ok(list_in(&state.clusters, namespace))
    }

    async fn get_database_cluster(&self, namespace: &str, name: &str) -> Result<DatabaseCluster> {
        let mut state = self.state();
        state.enter("get_database_cluster", name)?;
        get_in(&state.clusters, kinds::DATABASE_CLUSTER, namespace, name)
    }

    async fn create_database_cluster(&self, cluster: &DatabaseCluster) -> Result<DatabaseCluster> {
        let mut state = self.state();
        state.enter("create_database_cluster", &cluster.name_any())?;
        let version = state.next_version();
        create_in(&mut state.clusters, version, cluster)
    }

    async fn update_database_cluster(&self, cluster: &DatabaseCluster) -> Result<DatabaseCluster> {
        let mut state = self.state();
        state.enter("update_database_cluster", &cluster.name_any())?;
        let version = state.next_version();
        replace_in(&mut state.clusters, kinds::DATABASE_CLUSTER, version, cluster)
    }

    async fn delete_database_cluster(
        &self,
        namespace: &str,
        name: &str,
        cleanup_backups: bool,
    ) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_database_cluster", name)?;
        delete_in(&mut state.clusters, kinds::DATABASE_CLUSTER, namespace, name)?;
        if cleanup_backups {
            state
                .backups
                .retain(|(ns, _), b| !(ns == namespace && b.spec.db_cluster_name == name));
        }
        Ok(())
    }

    async fn list_database_cluster_backups(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DatabaseClusterBackup>> {
        let mut state = self.state();
        state.enter("list_database_cluster_backups", label_selector)?;
        let (label, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        Ok(list_in(&state.backups, namespace)
            .into_iter()
            .filter(|b| b.labels().get(label).is_some_and(|v| v == value))
            .collect())
    }

    async fn list_backup_storages(&self, namespace: &str) -> Result<Vec<BackupStorage>> {
        let mut state = self.state();
        state.enter("list_backup_storages", namespace)?;
        Ok(list_in(&state.storages, namespace))
    }

    async fn get_backup_storage(&self, namespace: &str, name: &str) -> Result<BackupStorage> {
        let mut state = self.state();
        state.enter("get_backup_storage", name)?;
        get_in(&state.storages, kinds::BACKUP_STORAGE, namespace, name)
    }

    async fn create_backup_storage(&self, storage: &BackupStorage) -> Result<BackupStorage> {
        let mut state = self.state();
        state.enter("create_backup_storage", &storage.name_any())?;
        let version = state.next_version();
        create_in(&mut state.storages, version, storage)
    }

    async fn update_backup_storage(&self, storage: &BackupStorage) -> Result<BackupStorage> {
        let mut state = self.state();
        state.enter("update_backup_storage", &storage.name_any())?;
        let version = state.next_version();
        replace_in(&mut state.storages, kinds::BACKUP_STORAGE, version, storage)
    }

    async fn delete_backup_storage(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_backup_storage", name)?;
        delete_in(&mut state.storages, kinds::BACKUP_STORAGE, namespace, name)
    }

    async fn list_monitoring_configs(&self, namespace: &str) -> Result<Vec<MonitoringConfig>> {
        let mut state = self.state();
        state.enter("list_monitoring_configs", namespace)?;
        Ok(list_in(&state.monitoring, namespace))
    }

    async fn get_monitoring_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<MonitoringConfig> {
        let mut state = self.state();
        state.enter("get_monitoring_config", name)?;
        get_in(&state.monitoring, kinds::MONITORING_CONFIG, namespace, name)
    }

    async fn create_monitoring_config(
        &self,
        config: &MonitoringConfig,
    ) -> Result<MonitoringConfig> {
        let mut state = self.state();
        state.enter("create_monitoring_config", &config.name_any())?;
        let version = state.next_version();
        create_in(&mut state.monitoring, version, config)
    }

    async fn update_monitoring_config(
        &self,
        config: &MonitoringConfig,
    ) -> Result<MonitoringConfig> {
        let mut state = self.state();
        state.enter("update_monitoring_config", &config.name_any())?;
        let version = state.next_version();
        replace_in(&mut state.monitoring, kinds::MONITORING_CONFIG, version, config)
    }

    async fn delete_monitoring_config(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_monitoring_config", name)?;
        delete_in(&mut state.monitoring, kinds::MONITORING_CONFIG, namespace, name)
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state();
        state.enter("create_secret", name)?;
        if state.secrets.contains_key(&key(namespace, name)) {
            return Err(Failure::Conflict.into_error());
        }
        state.secrets.insert(key(namespace, name), data);
        Ok(())
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state();
        state.enter("apply_secret", name)?;
        state.secrets.entry(key(namespace, name)).or_default().extend(data);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("delete_secret", name)?;
        state.secrets.remove(&key(namespace, name));
        Ok(())
    }

    async fn approve_install_plan(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.state();
        state.enter("approve_install_plan", name)?;
        let approved = state
            .install_plans
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::not_found(kinds::INSTALL_PLAN, name))?;
        if *approved {
            return Ok(false);
        }
        *approved = true;
        Ok(true)
    }
}

/// Version service answering from a fixed table.
#[derive(Default)]
pub struct StaticVersions {
    versions: HashMap<EngineType, Vec<String>>,
    calls: AtomicUsize,
}

impl StaticVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, engine: EngineType, versions: &[&str]) -> Self {
        self.versions
            .insert(engine, versions.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionService for StaticVersions {
    async fn supported_engine_versions(
        &self,
        engine: EngineType,
        operator_version: &str,
    ) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.versions.get(&engine).cloned().ok_or_else(|| {
            Error::VersionService(format!("no versions for {engine} {operator_version}"))
        })
    }
}
