use crate::crd::DatabaseEngine;
use crate::handlers::ValidationError;

/// Engine updates may only narrow the allowed versions to ones the running
/// operator actually offers.
pub fn validate_update(
    engine: &DatabaseEngine,
    current: &DatabaseEngine,
) -> Result<(), ValidationError> {
    if engine.spec.engine_type != current.spec.engine_type {
        return Err(ValidationError::EngineTypeImmutable);
    }
    match engine
        .spec
        .allowed_versions
        .iter()
        .find(|v| !current.has_available_engine_version(v))
    {
        Some(version) => Err(ValidationError::AllowedVersionUnavailable(version.clone())),
        None => Ok(()),
    }
}
