//! Admission rules for DatabaseCluster create and update.
//!
//! Everything a rule needs from the cluster is looked up beforehand and put in
//! a [`ValidationContext`], so the rules themselves are plain functions.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Datelike};

use super::engine_version::{validate_engine_version_upgrade, validate_version_allowed};
use super::quantity::Quantity;
use crate::crd::{
    BackupStorage, BackupStorageType, DatabaseCluster, DatabaseEngine, EngineType, ProxyType,
};
use crate::handlers::ValidationError;
use crate::version;

pub const MAX_PXC_ENGINE_REPLICAS: i32 = 5;
pub const MIN_PXC_PROXY_REPLICAS: i32 = 2;
pub const MIN_SHARDS: i32 = 1;
pub const MIN_CONFIG_SERVERS: i32 = 3;
pub const MIN_CONFIG_SERVERS_SINGLE_NODE: i32 = 1;
/// Backup repositories a psmdb or postgresql cluster may use over its lifetime
pub const MAX_BACKUP_STORAGES: usize = 3;
/// Lowest engine version a sharded psmdb cluster may run
pub const MIN_SHARDING_VERSION: &str = "1.17.0";

pub const MIN_CPU: &str = "600m";
pub const MIN_MEMORY: &str = "512M";
pub const MIN_STORAGE: &str = "1G";

/// Context for validation including old object for UPDATE operations
pub struct ValidationContext<'a> {
    pub cluster: &'a DatabaseCluster,
    pub engine: &'a DatabaseEngine,
    pub old_cluster: Option<&'a DatabaseCluster>,
    /// The PITR backup storage, when PITR names one that exists
    pub pitr_storage: Option<&'a BackupStorage>,
    /// Storages holding backups already taken from this cluster
    pub backup_history_storages: BTreeSet<String>,
    pub monitoring_config_exists: bool,
}

impl ValidationContext<'_> {
    pub fn is_create(&self) -> bool {
        self.old_cluster.is_none()
    }

    fn engine_type(&self) -> EngineType {
        self.cluster.engine_type()
    }
}

type Rule = fn(&ValidationContext) -> Result<(), ValidationError>;

/// Cluster rules in evaluation order; the first violation wins.
const RULES: &[Rule] = &[
    validate_engine,
    validate_proxy,
    validate_backup_spec,
    validate_backup_storages,
    validate_data_source,
    validate_monitoring,
    validate_pg_schedules,
    validate_backup_storage_limit,
    validate_sharding,
    validate_resources,
];

/// Run all validation rules and return the first failure
pub fn validate_all(ctx: &ValidationContext) -> Result<(), ValidationError> {
    RULES.iter().try_for_each(|rule| rule(ctx))
}

/// Rules that compare an update against the stored cluster.
pub fn validate_update(
    cluster: &DatabaseCluster,
    old: &DatabaseCluster,
) -> Result<(), ValidationError> {
    validate_update_allowed(old)?;

    let new_version = &cluster.spec.engine.version;
    let old_version = &old.spec.engine.version;
    if new_version != old_version && !new_version.is_empty() {
        validate_engine_version_upgrade(cluster.engine_type(), new_version, old_version)?;
    }

    let new_size = parse_quantity("storage", &cluster.spec.engine.storage.size)?;
    let old_size = parse_quantity("storage", &old.spec.engine.storage.size)?;
    if new_size < old_size {
        return Err(ValidationError::CannotShrinkStorage);
    }

    let new_replicas = cluster.spec.engine.replicas;
    let old_replicas = old.spec.engine.replicas;
    if new_replicas < old_replicas && new_replicas == 1 {
        return Err(ValidationError::ScaleDownToSingleNode { from: old_replicas });
    }

    match (old.sharding_enabled(), cluster.sharding_enabled()) {
        (false, true) => Err(ValidationError::ShardingEnablingNotSupported),
        (true, false) => Err(ValidationError::ShardingDisablingNotSupported),
        _ => Ok(()),
    }
}

/// Reject any change to a cluster that is mid-operation, whatever the change is.
pub fn validate_update_allowed(current: &DatabaseCluster) -> Result<(), ValidationError> {
    let state = current.app_state();
    if state.blocks_updates() {
        return Err(ValidationError::UpdateNotAllowedInState(state));
    }
    Ok(())
}

fn parse_quantity(field: &'static str, value: &str) -> Result<Quantity, ValidationError> {
    Quantity::parse_or_zero(value).map_err(|_| ValidationError::InvalidQuantity {
        field,
        value: value.to_string(),
    })
}

fn validate_engine(ctx: &ValidationContext) -> Result<(), ValidationError> {
    let engine = &ctx.cluster.spec.engine;
    validate_version_allowed(&engine.version, ctx.engine)?;

    let replicas = engine.replicas;
    match engine.engine_type {
        EngineType::Pxc => {
            if replicas > 0 && replicas % 2 == 0 {
                return Err(ValidationError::EvenEngineReplicas);
            }
            if replicas > MAX_PXC_ENGINE_REPLICAS {
                return Err(ValidationError::TooManyEngineReplicas {
                    max: MAX_PXC_ENGINE_REPLICAS,
                });
            }
        }
        EngineType::Psmdb => {
            if replicas > 0 && replicas % 2 == 0 {
                return Err(ValidationError::EvenEngineReplicas);
            }
        }
        EngineType::Postgresql => {}
    }
    Ok(())
}

fn validate_proxy(ctx: &ValidationContext) -> Result<(), ValidationError> {
    let proxy = &ctx.cluster.spec.proxy;
    if let Some(proxy_type) = proxy.proxy_type {
        match (ctx.engine_type(), proxy_type) {
            (EngineType::Pxc, ProxyType::Haproxy | ProxyType::Proxysql)
            | (EngineType::Psmdb, ProxyType::Mongos)
            | (EngineType::Postgresql, ProxyType::Pgbouncer) => {}
            (EngineType::Pxc, _) => return Err(ValidationError::UnsupportedPxcProxy),
            (EngineType::Psmdb, _) => return Err(ValidationError::UnsupportedPsmdbProxy),
            (EngineType::Postgresql, _) => return Err(ValidationError::UnsupportedPgProxy),
        }
    }

    if ctx.engine_type() == EngineType::Pxc
        && ctx.cluster.spec.engine.replicas > 1
        && let Some(replicas) = proxy.replicas
        && replicas < MIN_PXC_PROXY_REPLICAS
    {
        return Err(ValidationError::TooFewProxyReplicas {
            min: MIN_PXC_PROXY_REPLICAS,
        });
    }
    Ok(())
}

fn validate_backup_spec(ctx: &ValidationContext) -> Result<(), ValidationError> {
    let backup = &ctx.cluster.spec.backup;

    if backup.pitr.enabled {
        let storage_missing = backup
            .pitr
            .backup_storage_name
            .as_deref()
            .is_none_or(str::is_empty);
        if ctx.engine_type() == EngineType::Pxc && storage_missing {
            return Err(ValidationError::PitrNoBackupStorageName);
        }
        if backup.pitr.upload_interval_sec.is_some_and(|s| s <= 0) {
            return Err(ValidationError::PitrUploadInterval);
        }
    }

    let mut crons = HashSet::new();
    for schedule in &backup.schedules {
        if schedule.name.is_empty() {
            return Err(ValidationError::NoNameInSchedule);
        }
        if schedule.enabled && schedule.backup_storage_name.is_empty() {
            return Err(ValidationError::ScheduleNoBackupStorageName);
        }
        if !crons.insert(schedule.schedule.as_str()) {
            return Err(ValidationError::DuplicatedSchedules);
        }
    }
    Ok(())
}

fn validate_backup_storages(ctx: &ValidationContext) -> Result<(), ValidationError> {
    match ctx.engine_type() {
        EngineType::Psmdb => {
            let storages = ctx.cluster.schedule_storages();
            if storages.len() > 1 {
                return Err(ValidationError::PsmdbMultipleStorages);
            }
            let active = ctx.cluster.active_storage();
            if !active.is_empty() && storages.iter().any(|s| *s != active) {
                return Err(ValidationError::PsmdbViolateActiveStorage {
                    active: active.to_string(),
                });
            }
        }
        EngineType::Pxc if ctx.cluster.spec.backup.pitr.enabled => {
            let name = ctx
                .cluster
                .spec
                .backup
                .pitr
                .backup_storage_name
                .clone()
                .unwrap_or_default();
            match ctx.pitr_storage {
                Some(storage) if storage.spec.storage_type == BackupStorageType::S3 => {}
                Some(_) => return Err(ValidationError::PxcPitrS3Only),
                None => return Err(ValidationError::BackupStorageNotFound(name)),
            }
        }
        _ => {}
    }
    Ok(())
}

fn validate_data_source(ctx: &ValidationContext) -> Result<(), ValidationError> {
    let Some(source) = ctx.cluster.spec.data_source.as_ref() else {
        return Ok(());
    };

    let has_backup_name = !source.db_cluster_backup_name.is_empty();
    if has_backup_name == source.backup_source.is_some() {
        return Err(ValidationError::DataSourceConfig);
    }
    if let Some(backup_source) = &source.backup_source {
        if backup_source.backup_storage_name.is_empty() {
            return Err(ValidationError::DataSourceNoBackupStorageName);
        }
        if backup_source.path.is_empty() {
            return Err(ValidationError::DataSourceNoPath);
        }
    }

    if let Some(pitr) = &source.pitr {
        match pitr.pitr_type.as_str() {
            "" | "date" => {
                let raw = pitr
                    .date
                    .as_deref()
                    .ok_or(ValidationError::DataSourceNoPitrDate)?;
                let date = DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| ValidationError::DataSourceWrongDateFormat)?;
                if date.year() <= 1 {
                    return Err(ValidationError::DataSourceNoPitrDate);
                }
            }
            other => return Err(ValidationError::UnsupportedPitrType(other.to_string())),
        }
    }
    Ok(())
}

fn validate_monitoring(ctx: &ValidationContext) -> Result<(), ValidationError> {
    match ctx.cluster.monitoring_config_name() {
        Some(name) if !ctx.monitoring_config_exists => {
            Err(ValidationError::MonitoringConfigNotFound(name.to_string()))
        }
        _ => Ok(()),
    }
}

fn validate_pg_schedules(ctx: &ValidationContext) -> Result<(), ValidationError> {
    if ctx.engine_type() != EngineType::Postgresql {
        return Ok(());
    }
    let schedules = &ctx.cluster.spec.backup.schedules;

    let mut used = HashSet::new();
    for schedule in schedules.iter().filter(|s| !s.backup_storage_name.is_empty()) {
        if !used.insert(schedule.backup_storage_name.as_str()) {
            return Err(ValidationError::DuplicatedStoragePg);
        }
    }

    if let Some(old) = ctx.old_cluster {
        for schedule in schedules {
            let changed = old.spec.backup.schedules.iter().any(|prev| {
                prev.name == schedule.name
                    && prev.backup_storage_name != schedule.backup_storage_name
            });
            if changed {
                return Err(ValidationError::StorageChangePg);
            }
        }
    }
    Ok(())
}

fn validate_backup_storage_limit(ctx: &ValidationContext) -> Result<(), ValidationError> {
    let engine = ctx.engine_type();
    if engine == EngineType::Pxc {
        return Ok(());
    }
    let mut storages: BTreeSet<&str> = ctx.cluster.schedule_storages();
    storages.extend(ctx.backup_history_storages.iter().map(String::as_str));
    if storages.len() > MAX_BACKUP_STORAGES {
        return Err(ValidationError::TooManyStorages {
            limit: MAX_BACKUP_STORAGES,
            engine,
        });
    }
    Ok(())
}

fn validate_sharding(ctx: &ValidationContext) -> Result<(), ValidationError> {
    let Some(sharding) = ctx.cluster.spec.sharding.as_ref().filter(|s| s.enabled) else {
        return Ok(());
    };
    if ctx.engine_type() != EngineType::Psmdb {
        return Err(ValidationError::ShardingNotSupported(ctx.engine_type()));
    }

    // an empty or unparseable engine version cannot be shown to qualify
    let engine_version = version::parse(&ctx.cluster.spec.engine.version);
    let min_version = version::parse(MIN_SHARDING_VERSION);
    let supported = match (engine_version, min_version) {
        (Some(current), Some(min)) => current >= min,
        _ => false,
    };
    if !supported {
        return Err(ValidationError::ShardingVersion {
            min: MIN_SHARDING_VERSION.to_string(),
        });
    }

    if sharding.shards < MIN_SHARDS {
        return Err(ValidationError::InsufficientShards { min: MIN_SHARDS });
    }
    let config_servers = sharding.config_server.replicas;
    let replicas = ctx.cluster.spec.engine.replicas;
    if replicas == 1 && config_servers < MIN_CONFIG_SERVERS_SINGLE_NODE {
        return Err(ValidationError::InsufficientConfigServersSingleNode {
            min: MIN_CONFIG_SERVERS_SINGLE_NODE,
        });
    }
    if replicas > 1 && config_servers < MIN_CONFIG_SERVERS {
        return Err(ValidationError::InsufficientConfigServers {
            min: MIN_CONFIG_SERVERS,
        });
    }
    if config_servers % 2 == 0 {
        return Err(ValidationError::EvenConfigServers);
    }
    Ok(())
}

fn validate_resources(ctx: &ValidationContext) -> Result<(), ValidationError> {
    let engine = &ctx.cluster.spec.engine;
    let cpu = parse_quantity("cpu", &engine.resources.cpu)?;
    let memory = parse_quantity("memory", &engine.resources.memory)?;
    let storage = parse_quantity("storage", &engine.storage.size)?;

    if cpu.is_zero() && memory.is_zero() {
        return Err(ValidationError::NoResourcesDefined);
    }
    if cpu < Quantity::from_millis(600) {
        return Err(ValidationError::NotEnoughCpu { min: MIN_CPU });
    }
    if memory < Quantity::from_units(512_000_000) {
        return Err(ValidationError::NotEnoughMemory { min: MIN_MEMORY });
    }
    if storage < Quantity::from_units(1_000_000_000) {
        return Err(ValidationError::NotEnoughDiskSize { min: MIN_STORAGE });
    }
    Ok(())
}
