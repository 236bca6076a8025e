//! Common utilities for Kubernetes resource generation
//!
//! Shared constants and helpers used by the job generators and the
//! availability guard so that ownership and labeling stay consistent.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::{PGUpgrade, labels};

/// API version for the PGUpgrade CRD
pub const API_VERSION: &str = "postgres-operator.smoketurner.com/v1alpha1";

/// Kind for the PGUpgrade CRD
pub const KIND: &str = "PGUpgrade";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "pg-upgrade-operator";

/// Generate an owner reference for a PGUpgrade
///
/// Jobs carry this reference so that deleting the PGUpgrade lets the garbage
/// collector remove them, including any that are still running.
pub fn owner_reference(upgrade: &PGUpgrade) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: upgrade.name_any(),
        uid: upgrade.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels shared by every job generated for a PGUpgrade
pub fn upgrade_labels(upgrade: &PGUpgrade, role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            labels::CLUSTER.to_string(),
            upgrade.spec.postgres_cluster_name.clone(),
        ),
        (labels::PGUPGRADE.to_string(), upgrade.name_any()),
        (labels::ROLE.to_string(), role.to_string()),
    ])
}

/// Label selector matching the instance StatefulSets of a cluster
pub fn instance_selector(cluster_name: &str) -> String {
    format!(
        "{}={},{}={}",
        labels::CLUSTER,
        cluster_name,
        labels::DATA,
        labels::DATA_POSTGRES
    )
}

/// Label selector matching the pod of the cluster's current primary
pub fn primary_selector(cluster_name: &str) -> String {
    format!(
        "{}={},{}={}",
        labels::CLUSTER,
        cluster_name,
        labels::ROLE,
        labels::ROLE_MASTER
    )
}
