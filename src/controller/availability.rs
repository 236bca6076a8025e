//! Cluster availability guard
//!
//! The reconciler never edits instance replica counts directly. It asks a
//! [`ClusterAvailability`] implementation to observe and request replicas,
//! which keeps the upgrade logic independent of how the cluster is run.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info};

use crate::controller::error::UpgradeResult;
use crate::controller::state_machine::ReplicaCounts;
use crate::resources::common::{FIELD_MANAGER, instance_selector};

/// The cluster an upgrade acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTarget {
    pub namespace: String,
    pub cluster: String,
    /// Instance that is started first when replicas are requested
    pub startup_instance: Option<String>,
}

/// Observes and controls how many instances of a cluster run
#[async_trait]
pub trait ClusterAvailability: Send + Sync {
    /// Replicas requested and ready across every instance of the cluster
    async fn observe_ready_replicas(&self, target: &ClusterTarget) -> UpgradeResult<ReplicaCounts>;

    /// Ask the cluster to run `replicas` instances.
    ///
    /// Returns once the request is recorded; callers observe readiness
    /// separately.
    async fn request_replicas(&self, target: &ClusterTarget, replicas: i32) -> UpgradeResult<()>;
}

/// Availability backed by the instance StatefulSets of a cluster.
///
/// Each instance runs at most one pod. Requesting `n` replicas sets the first
/// `n` instances to 1 and the rest to 0, starting with the startup instance.
#[derive(Clone)]
pub struct StatefulSetAvailability {
    client: Client,
}

impl StatefulSetAvailability {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn instances(&self, target: &ClusterTarget) -> UpgradeResult<Vec<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
        let list = api
            .list(&ListParams::default().labels(&instance_selector(&target.cluster)))
            .await?;
        Ok(list.items)
    }
}

#[async_trait]
impl ClusterAvailability for StatefulSetAvailability {
    async fn observe_ready_replicas(&self, target: &ClusterTarget) -> UpgradeResult<ReplicaCounts> {
        let instances = self.instances(target).await?;
        Ok(replica_counts(&instances))
    }

    async fn request_replicas(&self, target: &ClusterTarget, replicas: i32) -> UpgradeResult<()> {
        let instances = self.instances(target).await?;
        let current: BTreeMap<String, i32> = instances
            .iter()
            .map(|sts| (sts.name_any(), requested_replicas(sts)))
            .collect();

        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
        for (name, value) in plan_replicas(&current, target.startup_instance.as_deref(), replicas) {
            debug!(statefulset = %name, replicas = value, "Setting instance replicas");
            let patch = serde_json::json!({ "spec": { "replicas": value } });
            api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await?;
        }

        info!(
            cluster = %target.cluster,
            namespace = %target.namespace,
            replicas,
            "Requested cluster replicas"
        );
        Ok(())
    }
}

/// Replicas requested by a StatefulSet, defaulting to 1 like the API server
fn requested_replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// Sum requested and ready replicas across instances
pub fn replica_counts(instances: &[StatefulSet]) -> ReplicaCounts {
    instances.iter().fold(ReplicaCounts::default(), |acc, sts| {
        let ready = sts
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        ReplicaCounts {
            requested: acc.requested.saturating_add(requested_replicas(sts)),
            ready: acc.ready.saturating_add(ready),
        }
    })
}

/// Per-instance replica changes needed to run `replicas` instances.
///
/// The startup instance is ordered first, the rest by name. Only instances
/// whose count differs are returned.
pub fn plan_replicas(
    current: &BTreeMap<String, i32>,
    startup_instance: Option<&str>,
    replicas: i32,
) -> Vec<(String, i32)> {
    let mut order: Vec<&String> = current.keys().collect();
    order.sort_by_key(|name| Some(name.as_str()) != startup_instance);

    let wanted = usize::try_from(replicas.max(0)).unwrap_or(0);
    order
        .into_iter()
        .enumerate()
        .filter_map(|(i, name)| {
            let value = i32::from(i < wanted);
            (current.get(name) != Some(&value)).then(|| (name.clone(), value))
        })
        .collect()
}
