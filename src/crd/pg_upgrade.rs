//! PGUpgrade CRD for in-place PostgreSQL major version upgrades.
//!
//! A PGUpgrade names an existing cluster and a pair of major versions. The
//! operator quiesces the cluster, runs `pg_upgrade --link` against the data
//! directory of the startup instance, removes the superseded data directories
//! of the remaining instances and then returns the cluster to service.
//!
//! The source data directory is never deleted before the upgrade job has
//! succeeded, and a failed upgrade is never retried automatically.

use k8s_openapi::api::core::v1::{Affinity, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PGUpgrade is the Schema for requesting a PostgreSQL major version upgrade
/// of a running cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PGUpgrade",
    plural = "pgupgrades",
    shortname = "pgu",
    namespaced,
    status = "PGUpgradeStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.postgresClusterName"}"#,
    printcolumn = r#"{"name":"From", "type":"integer", "jsonPath":".spec.fromPostgresVersion"}"#,
    printcolumn = r#"{"name":"To", "type":"integer", "jsonPath":".spec.toPostgresVersion"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PGUpgradeSpec {
    /// Name of the cluster whose data is upgraded.
    /// The cluster must live in the same namespace as the PGUpgrade.
    pub postgres_cluster_name: String,

    /// Container image carrying both the old and the new PostgreSQL binaries
    /// under `/usr/pgsql-<version>/bin`.
    pub image: String,

    /// Image pull policy for the upgrade and removal jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Secrets used to pull the upgrade image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<ImagePullSecret>,

    /// Major version currently on disk (e.g., 15)
    pub from_postgres_version: i32,

    /// Major version to upgrade to (e.g., 17)
    pub to_postgres_version: i32,

    /// Resource requirements for the generated jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Scheduling constraints for the generated jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Tolerations for the generated jobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Priority class for the generated jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

/// Reference to an image pull secret
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct ImagePullSecret {
    /// Name of the secret
    pub name: String,
}

/// Resource requirements for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
pub struct ResourceRequirements {
    /// CPU and memory limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// CPU and memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "3.14")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Status of a PGUpgrade
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PGUpgradeStatus {
    /// Current phase of the upgrade
    #[serde(default)]
    pub phase: UpgradePhase,

    /// Conditions describing the upgrade state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the spec last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human-readable summary of the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Name of the instance StatefulSet whose data directory is upgraded.
    /// Chosen once before scale-down and never changed afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_instance: Option<String>,

    /// Replica count the cluster had before it was scaled down.
    /// Restored when the upgrade reaches ScalingUp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i32>,

    /// When the current phase started (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<String>,

    /// When the upgrade left Pending (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// When the upgrade reached a terminal phase (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Consecutive reconcile failures, used for backoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i32>,

    /// Last reconcile error, cleared on the next successful reconcile.
    /// Serialized as `null` when unset so a merge patch removes it.
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Phase of a PGUpgrade.
///
/// ```text
/// Pending → ScalingDown → Upgrading → Validating → RemovingOldData → ScalingUp → Succeeded
///                  ↓ (any non-terminal phase except RemovingOldData)
///                Failed
/// ```
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum UpgradePhase {
    /// Upgrade has not started; spec validation happens here
    #[default]
    Pending,
    /// Waiting for every instance of the cluster to stop
    ScalingDown,
    /// The upgrade job is running against the startup instance's volume
    Upgrading,
    /// Checking that the upgrade job produced the destination version
    Validating,
    /// Removing the superseded data directories of the other instances
    RemovingOldData,
    /// Waiting for the cluster to return to its previous replica count
    ScalingUp,
    /// Upgrade completed
    Succeeded,
    /// Upgrade failed and needs operator attention
    Failed,
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradePhase::Pending => write!(f, "Pending"),
            UpgradePhase::ScalingDown => write!(f, "ScalingDown"),
            UpgradePhase::Upgrading => write!(f, "Upgrading"),
            UpgradePhase::Validating => write!(f, "Validating"),
            UpgradePhase::RemovingOldData => write!(f, "RemovingOldData"),
            UpgradePhase::ScalingUp => write!(f, "ScalingUp"),
            UpgradePhase::Succeeded => write!(f, "Succeeded"),
            UpgradePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl UpgradePhase {
    /// Returns true if this is a terminal phase (no further transitions expected)
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpgradePhase::Succeeded | UpgradePhase::Failed)
    }

    /// Position of the phase along the forward path.
    /// `Failed` sorts after every other phase.
    pub fn ordinal(&self) -> u8 {
        match self {
            UpgradePhase::Pending => 0,
            UpgradePhase::ScalingDown => 1,
            UpgradePhase::Upgrading => 2,
            UpgradePhase::Validating => 3,
            UpgradePhase::RemovingOldData => 4,
            UpgradePhase::ScalingUp => 5,
            UpgradePhase::Succeeded => 6,
            UpgradePhase::Failed => 7,
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl PGUpgrade {
    /// Current phase, `Pending` when no status has been written yet
    pub fn phase(&self) -> UpgradePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

/// Label keys shared by the operator's generated resources
pub mod labels {
    /// Cluster the resource belongs to
    pub const CLUSTER: &str = "postgres-operator.smoketurner.com/cluster";
    /// PGUpgrade that generated the resource
    pub const PGUPGRADE: &str = "postgres-operator.smoketurner.com/pgupgrade";
    /// Role of a generated job (`pgupgrade` or `removedata`)
    pub const ROLE: &str = "postgres-operator.smoketurner.com/role";
    /// Destination major version of an upgrade job
    pub const VERSION: &str = "postgres-operator.smoketurner.com/version";
    /// Marks StatefulSets that hold a PostgreSQL data directory
    pub const DATA: &str = "postgres-operator.smoketurner.com/data";

    /// Role value for upgrade jobs
    pub const ROLE_PGUPGRADE: &str = "pgupgrade";
    /// Role value for data removal jobs
    pub const ROLE_REMOVEDATA: &str = "removedata";
    /// Role value carried by the pod of the current primary
    pub const ROLE_MASTER: &str = "master";
    /// Value of the data label on instance StatefulSets
    pub const DATA_POSTGRES: &str = "postgres";
}

/// Annotation keys on generated resources
pub mod annotations {
    /// Instance StatefulSet an upgrade job was generated from
    pub const INSTANCE: &str = "postgres-operator.smoketurner.com/instance";
}
