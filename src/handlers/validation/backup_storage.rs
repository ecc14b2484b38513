use kube::ResourceExt;

use super::{validate_rfc1035, validate_url};
use crate::crd::{BackupStorageType, DatabaseCluster};
use crate::handlers::{CreateBackupStorageRequest, UpdateBackupStorageRequest, ValidationError};

pub fn validate_create(req: &CreateBackupStorageRequest) -> Result<(), ValidationError> {
    validate_rfc1035(&req.name)?;
    if req.bucket_name.is_empty() {
        return Err(ValidationError::EmptyBucket);
    }
    if req.storage_type == BackupStorageType::S3 && req.region.is_empty() {
        return Err(ValidationError::S3RegionRequired);
    }
    if let Some(url) = req.url.as_deref().filter(|u| !u.is_empty()) {
        validate_url("url", url)?;
    }
    if req.access_key.is_empty() || req.secret_key.is_empty() {
        return Err(ValidationError::MissingCredentials);
    }
    Ok(())
}

pub fn validate_update(req: &UpdateBackupStorageRequest) -> Result<(), ValidationError> {
    if req.bucket_name.as_deref().is_some_and(str::is_empty) {
        return Err(ValidationError::EmptyBucket);
    }
    if let Some(url) = req.url.as_deref().filter(|u| !u.is_empty()) {
        validate_url("url", url)?;
    }
    // Keys are rotated as a pair.
    if req.access_key.is_some() != req.secret_key.is_some() {
        return Err(ValidationError::MissingCredentials);
    }
    Ok(())
}

/// A storage cannot be removed while a cluster still writes to or restores
/// from it.
pub fn validate_delete(name: &str, clusters: &[DatabaseCluster]) -> Result<(), ValidationError> {
    match clusters
        .iter()
        .find(|c| c.referenced_backup_storages().contains(name))
    {
        Some(cluster) => Err(ValidationError::BackupStorageInUse {
            name: name.to_string(),
            cluster: cluster.name_any(),
        }),
        None => Ok(()),
    }
}
