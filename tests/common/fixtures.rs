//! Builders for the custom resources and requests the pipeline handles
//!
//! ```rust,ignore
//! let cluster = ClusterBuilder::new("db", "default", EngineType::Psmdb)
//!     .with_version("6.0.5")
//!     .with_replicas(3)
//!     .with_status(AppState::Ready)
//!     .build();
//! let engine = EngineBuilder::new("default", EngineType::Psmdb)
//!     .with_operator_version("1.16.0")
//!     .with_available_versions(&["6.0.5", "7.0.2"])
//!     .with_pending_upgrade("1.17.0", "install-abc")
//!     .build();
//! ```

use std::collections::BTreeMap;

use dbaas_control_plane::crd::{
    AppState, BackupSchedule, BackupSpec, BackupStorage, BackupStorageSpec, BackupStorageType,
    CLUSTER_NAME_LABEL, Component, ConfigServerSpec, DatabaseCluster, DatabaseClusterBackup,
    DatabaseClusterBackupSpec, DatabaseClusterSpec, DatabaseClusterStatus, DatabaseEngine,
    DatabaseEngineSpec, DatabaseEngineStatus, EngineSpec, EngineType, LocalObjectRef,
    MonitoringConfig, MonitoringConfigSpec, MonitoringSpec, MonitoringType, OperatorUpgrade,
    PitrSpec, PmmConfig, ProxySpec, Resources, ShardingSpec, Storage,
};
use dbaas_control_plane::handlers::{
    CreateBackupStorageRequest, CreateMonitoringInstanceRequest, PmmCredentials,
};
use kube::core::ObjectMeta;

pub const NAMESPACE: &str = "default";

pub fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Default engine version for each engine type, kept in sync with the
/// versions [`EngineBuilder::installed`] marks available.
pub fn default_version(engine_type: EngineType) -> &'static str {
    match engine_type {
        EngineType::Pxc => "8.0.32-24.2",
        EngineType::Psmdb => "6.0.5-4",
        EngineType::Postgresql => "15.4",
    }
}

// =============================================================================
// DatabaseCluster
// =============================================================================

pub struct ClusterBuilder {
    cluster: DatabaseCluster,
}

impl ClusterBuilder {
    /// A cluster that passes every admission rule against an engine built
    /// with [`EngineBuilder::installed`].
    pub fn new(name: &str, namespace: &str, engine_type: EngineType) -> Self {
        let replicas = match engine_type {
            EngineType::Postgresql => 2,
            _ => 3,
        };
        let proxy = match engine_type {
            EngineType::Pxc => ProxySpec {
                replicas: Some(2),
                ..Default::default()
            },
            _ => ProxySpec::default(),
        };
        let cluster = DatabaseCluster {
            metadata: meta(namespace, name),
            spec: DatabaseClusterSpec {
                engine: EngineSpec {
                    engine_type,
                    version: default_version(engine_type).to_string(),
                    replicas,
                    resources: Resources {
                        cpu: "1".to_string(),
                        memory: "2G".to_string(),
                    },
                    storage: Storage {
                        size: "15G".to_string(),
                        class: None,
                    },
                },
                proxy,
                backup: BackupSpec::default(),
                sharding: None,
                data_source: None,
                monitoring: None,
            },
            status: None,
        };
        Self { cluster }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.cluster.spec.engine.version = version.to_string();
        self
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.cluster.spec.engine.replicas = replicas;
        self
    }

    pub fn with_storage_size(mut self, size: &str) -> Self {
        self.cluster.spec.engine.storage.size = size.to_string();
        self
    }

    pub fn with_status(mut self, state: AppState) -> Self {
        self.cluster
            .status
            .get_or_insert_with(DatabaseClusterStatus::default)
            .status = state;
        self
    }

    pub fn with_recommended_cr_version(mut self, version: &str) -> Self {
        self.cluster
            .status
            .get_or_insert_with(DatabaseClusterStatus::default)
            .recommended_cr_version = Some(version.to_string());
        self
    }

    pub fn with_schedule(mut self, name: &str, cron: &str, storage: &str) -> Self {
        self.cluster.spec.backup.schedules.push(BackupSchedule {
            name: name.to_string(),
            enabled: true,
            schedule: cron.to_string(),
            backup_storage_name: storage.to_string(),
            retention_copies: None,
        });
        self
    }

    pub fn with_pitr(mut self, storage: &str) -> Self {
        self.cluster.spec.backup.pitr = PitrSpec {
            enabled: true,
            backup_storage_name: Some(storage.to_string()),
            upload_interval_sec: None,
        };
        self
    }

    pub fn with_sharding(mut self, shards: i32, config_servers: i32) -> Self {
        self.cluster.spec.sharding = Some(ShardingSpec {
            enabled: true,
            shards,
            config_server: ConfigServerSpec {
                replicas: config_servers,
            },
        });
        self
    }

    pub fn with_monitoring(mut self, config: &str) -> Self {
        self.cluster.spec.monitoring = Some(MonitoringSpec {
            monitoring_config_name: config.to_string(),
        });
        self
    }

    pub fn build(self) -> DatabaseCluster {
        self.cluster
    }
}

// =============================================================================
// DatabaseEngine
// =============================================================================

pub struct EngineBuilder {
    engine: DatabaseEngine,
}

impl EngineBuilder {
    pub fn new(namespace: &str, engine_type: EngineType) -> Self {
        let engine = DatabaseEngine {
            metadata: meta(namespace, engine_type.operator_name()),
            spec: DatabaseEngineSpec {
                engine_type,
                allowed_versions: vec![],
            },
            status: Some(DatabaseEngineStatus {
                status: "installed".to_string(),
                operator_version: "1.17.0".to_string(),
                ..Default::default()
            }),
        };
        Self { engine }
    }

    /// An installed engine offering [`default_version`].
    pub fn installed(namespace: &str, engine_type: EngineType) -> Self {
        Self::new(namespace, engine_type).with_available_versions(&[default_version(engine_type)])
    }

    fn status(&mut self) -> &mut DatabaseEngineStatus {
        self.engine
            .status
            .get_or_insert_with(DatabaseEngineStatus::default)
    }

    pub fn with_operator_version(mut self, version: &str) -> Self {
        self.status().operator_version = version.to_string();
        self
    }

    pub fn with_available_versions(mut self, versions: &[&str]) -> Self {
        let engine = &mut self.status().available_versions.engine;
        for version in versions {
            engine.insert(
                version.to_string(),
                Component {
                    status: "available".to_string(),
                    ..Default::default()
                },
            );
        }
        self
    }

    pub fn with_allowed_versions(mut self, versions: &[&str]) -> Self {
        self.engine.spec.allowed_versions = versions.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_pending_upgrade(mut self, target_version: &str, install_plan: &str) -> Self {
        self.status().pending_operator_upgrades.push(OperatorUpgrade {
            target_version: target_version.to_string(),
            install_plan_ref: LocalObjectRef {
                name: install_plan.to_string(),
            },
        });
        self
    }

    pub fn locked(mut self) -> Self {
        self.engine.set_upgrade_lock(true);
        self
    }

    pub fn build(self) -> DatabaseEngine {
        self.engine
    }
}

// =============================================================================
// Backup storages, monitoring configs and backups
// =============================================================================

pub fn backup_storage(
    namespace: &str,
    name: &str,
    storage_type: BackupStorageType,
) -> BackupStorage {
    BackupStorage {
        metadata: meta(namespace, name),
        spec: BackupStorageSpec {
            storage_type,
            bucket: format!("{name}-bucket"),
            region: "us-east-1".to_string(),
            endpoint_url: "https://s3.us-east-1.amazonaws.com".to_string(),
            description: String::new(),
            credentials_secret_name: BackupStorage::secret_name_for(name),
            verify_tls: None,
            force_path_style: None,
        },
    }
}

pub fn monitoring_config(namespace: &str, name: &str) -> MonitoringConfig {
    MonitoringConfig {
        metadata: meta(namespace, name),
        spec: MonitoringConfigSpec {
            monitoring_type: MonitoringType::Pmm,
            pmm: PmmConfig {
                url: "https://pmm.example.com".to_string(),
                image: String::new(),
            },
            credentials_secret_name: MonitoringConfig::secret_name_for(name),
            verify_tls: None,
        },
    }
}

pub fn cluster_backup(
    namespace: &str,
    name: &str,
    cluster: &str,
    storage: &str,
) -> DatabaseClusterBackup {
    let mut metadata = meta(namespace, name);
    metadata.labels = Some(BTreeMap::from([(
        CLUSTER_NAME_LABEL.to_string(),
        cluster.to_string(),
    )]));
    DatabaseClusterBackup {
        metadata,
        spec: DatabaseClusterBackupSpec {
            db_cluster_name: cluster.to_string(),
            backup_storage_name: storage.to_string(),
        },
        status: None,
    }
}

pub fn s3_storage_request(name: &str) -> CreateBackupStorageRequest {
    CreateBackupStorageRequest {
        name: name.to_string(),
        storage_type: BackupStorageType::S3,
        bucket_name: "backups".to_string(),
        region: "us-east-1".to_string(),
        url: Some("https://s3.us-east-1.amazonaws.com".to_string()),
        access_key: "AKIA-test".to_string(),
        secret_key: "secret-test".to_string(),
        description: None,
        verify_tls: None,
        force_path_style: None,
    }
}

pub fn pmm_request(name: &str) -> CreateMonitoringInstanceRequest {
    CreateMonitoringInstanceRequest {
        name: name.to_string(),
        monitoring_type: "pmm".to_string(),
        url: "https://pmm.example.com".to_string(),
        pmm: Some(PmmCredentials {
            api_key: "pmm-api-key".to_string(),
            ..Default::default()
        }),
        verify_tls: None,
    }
}
