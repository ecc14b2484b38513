use super::{validate_rfc1035, validate_url};
use crate::handlers::{
    CreateMonitoringInstanceRequest, PmmCredentials, UpdateMonitoringInstanceRequest,
    ValidationError,
};

const PMM: &str = "pmm";

fn validate_pmm(pmm: Option<&PmmCredentials>) -> Result<(), ValidationError> {
    match pmm {
        None => Err(ValidationError::MissingPmmConfig),
        Some(creds) if !creds.is_complete() => Err(ValidationError::MissingPmmCredentials),
        Some(_) => Ok(()),
    }
}

pub fn validate_create(req: &CreateMonitoringInstanceRequest) -> Result<(), ValidationError> {
    validate_rfc1035(&req.name)?;
    validate_url("url", &req.url)?;
    match req.monitoring_type.as_str() {
        PMM => validate_pmm(req.pmm.as_ref()),
        other => Err(ValidationError::UnsupportedMonitoringType(other.to_string())),
    }
}

pub fn validate_update(req: &UpdateMonitoringInstanceRequest) -> Result<(), ValidationError> {
    if !req.url.is_empty() {
        validate_url("url", &req.url)?;
    }
    match req.monitoring_type.as_str() {
        "" => Ok(()),
        PMM => validate_pmm(req.pmm.as_ref()),
        other => Err(ValidationError::UnsupportedMonitoringType(other.to_string())),
    }
}
