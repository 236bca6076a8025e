//! Validation logic for PGUpgrade specs
//!
//! Failures here are permanent: the upgrade holds in its current phase until
//! the PGUpgrade is edited.

use crate::controller::error::{UpgradeError, UpgradeResult};
use crate::crd::{PGUpgrade, ResourceList};
use crate::resources::quantity::canonical_quantity;

/// Image pull policies accepted by Kubernetes
pub const IMAGE_PULL_POLICIES: [&str; 3] = ["Always", "IfNotPresent", "Never"];

/// Validate the upgrade spec
pub fn validate_upgrade(upgrade: &PGUpgrade) -> UpgradeResult<()> {
    let spec = &upgrade.spec;

    if spec.postgres_cluster_name.trim().is_empty() {
        return Err(UpgradeError::ValidationError(
            "postgresClusterName is required".to_string(),
        ));
    }

    if spec.image.trim().is_empty() {
        return Err(UpgradeError::ValidationError("image is required".to_string()));
    }

    validate_versions(spec.from_postgres_version, spec.to_postgres_version)?;

    if let Some(policy) = &spec.image_pull_policy
        && !IMAGE_PULL_POLICIES.contains(&policy.as_str())
    {
        return Err(UpgradeError::ValidationError(format!(
            "imagePullPolicy must be one of {}: {}",
            IMAGE_PULL_POLICIES.join(", "),
            policy
        )));
    }

    if let Some(resources) = &spec.resources {
        validate_resource_list("limits", resources.limits.as_ref())?;
        validate_resource_list("requests", resources.requests.as_ref())?;
    }

    Ok(())
}

/// Validate a major version pair
pub fn validate_versions(from: i32, to: i32) -> UpgradeResult<()> {
    if from <= 0 || to <= 0 {
        return Err(UpgradeError::ValidationError(format!(
            "versions must be positive: {} -> {}",
            from, to
        )));
    }

    if to <= from {
        return Err(UpgradeError::DowngradeNotAllowed {
            from_version: from,
            to_version: to,
        });
    }

    Ok(())
}

fn validate_resource_list(field: &str, list: Option<&ResourceList>) -> UpgradeResult<()> {
    let Some(list) = list else {
        return Ok(());
    };

    for (name, value) in [("cpu", &list.cpu), ("memory", &list.memory)] {
        if let Some(value) = value {
            canonical_quantity(value).map_err(|e| {
                UpgradeError::ValidationError(format!(
                    "resources.{}.{} {:?}: {}",
                    field, name, value, e
                ))
            })?;
        }
    }

    Ok(())
}
