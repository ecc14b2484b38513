//! Engine version rules: the allow-list check and the in-place upgrade check.

use crate::crd::{DatabaseEngine, EngineType};
use crate::handlers::ValidationError;
use crate::version;

/// The requested version must be allowed by the engine, or available when no
/// allow-list is configured. An empty version is always accepted.
pub fn validate_version_allowed(
    version: &str,
    engine: &DatabaseEngine,
) -> Result<(), ValidationError> {
    if version.is_empty() {
        return Ok(());
    }
    if !engine.spec.allowed_versions.is_empty() {
        if engine.spec.allowed_versions.iter().any(|v| v == version) {
            return Ok(());
        }
        return Err(ValidationError::VersionNotAllowed {
            version: version.to_string(),
            engine: engine.spec.engine_type,
        });
    }
    if engine.has_available_engine_version(version) {
        Ok(())
    } else {
        Err(ValidationError::VersionNotAvailable {
            version: version.to_string(),
        })
    }
}

/// Check an engine version change on an existing cluster.
///
/// Downgrades are refused. Major upgrades are refused except for psmdb, which
/// may move to the next major only.
pub fn validate_engine_version_upgrade(
    engine: EngineType,
    new_version: &str,
    old_version: &str,
) -> Result<(), ValidationError> {
    let new = version::parse(new_version)
        .ok_or_else(|| ValidationError::InvalidVersion(new_version.to_string()))?;
    // An unparseable current version sorts below any valid one.
    let Some(old) = version::parse(old_version) else {
        return Ok(());
    };

    if new < old {
        return Err(ValidationError::EngineDowngrade);
    }
    if new.major == old.major {
        return Ok(());
    }
    if engine != EngineType::Psmdb {
        return Err(ValidationError::MajorVersionUpgrade);
    }
    if new.major - old.major > 1 {
        return Err(ValidationError::MajorUpgradeNotSequential);
    }
    Ok(())
}
