//! Test fixtures and builders for PGUpgrade resources and the cluster
//! objects they act on
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let upgrade = create_test_upgrade("pgu", "db", "pg", 15, 17);
//! let instances = create_test_instances("pg", &["pg-a", "pg-b"]);
//! ```
//!
//! For more complex configurations, use the builder:
//! ```rust,ignore
//! let upgrade = PGUpgradeBuilder::new("pgu", "db")
//!     .cluster("pg")
//!     .versions(15, 17)
//!     .cpu_request("500m")
//!     .build();
//! ```

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, SecurityContext, VolumeMount,
};
use kube::core::ObjectMeta;
use pg_upgrade_operator::crd::{
    ImagePullSecret, PGUpgrade, PGUpgradeSpec, PGUpgradeStatus, ResourceList,
    ResourceRequirements, UpgradePhase, labels,
};

// =============================================================================
// Convenience Functions for Simple Test Cases
// =============================================================================

/// Create a PGUpgrade with the given cluster and versions
pub fn create_test_upgrade(
    name: &str,
    namespace: &str,
    cluster: &str,
    from: i32,
    to: i32,
) -> PGUpgrade {
    PGUpgradeBuilder::new(name, namespace)
        .cluster(cluster)
        .versions(from, to)
        .build()
}

/// Create instance StatefulSets for a cluster, one per name
pub fn create_test_instances(cluster: &str, names: &[&str]) -> Vec<StatefulSet> {
    names
        .iter()
        .map(|name| InstanceBuilder::new(name, cluster).build())
        .collect()
}

/// A job whose status carries a single True condition of `type_`
pub fn job_with_condition(name: &str, type_: &str) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: type_.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// PGUpgrade Builder
// =============================================================================

pub struct PGUpgradeBuilder {
    name: String,
    namespace: String,
    uid: Option<String>,
    spec: PGUpgradeSpec,
    status: Option<PGUpgradeStatus>,
}

impl PGUpgradeBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: Some(format!("{}-uid", name)),
            spec: PGUpgradeSpec {
                postgres_cluster_name: "pg".to_string(),
                image: "postgres-upgrade:latest".to_string(),
                from_postgres_version: 15,
                to_postgres_version: 17,
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn cluster(mut self, cluster: &str) -> Self {
        self.spec.postgres_cluster_name = cluster.to_string();
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        self.spec.image = image.to_string();
        self
    }

    pub fn uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }

    pub fn versions(mut self, from: i32, to: i32) -> Self {
        self.spec.from_postgres_version = from;
        self.spec.to_postgres_version = to;
        self
    }

    pub fn cpu_request(mut self, cpu: &str) -> Self {
        let resources = self
            .spec
            .resources
            .get_or_insert_with(ResourceRequirements::default);
        resources
            .requests
            .get_or_insert_with(ResourceList::default)
            .cpu = Some(cpu.to_string());
        self
    }

    pub fn memory_limit(mut self, memory: &str) -> Self {
        let resources = self
            .spec
            .resources
            .get_or_insert_with(ResourceRequirements::default);
        resources
            .limits
            .get_or_insert_with(ResourceList::default)
            .memory = Some(memory.to_string());
        self
    }

    pub fn pull_secret(mut self, name: &str) -> Self {
        self.spec.image_pull_secrets.push(ImagePullSecret {
            name: name.to_string(),
        });
        self
    }

    pub fn phase(mut self, phase: UpgradePhase) -> Self {
        self.status.get_or_insert_with(PGUpgradeStatus::default).phase = phase;
        self
    }

    pub fn build(self) -> PGUpgrade {
        let mut upgrade = PGUpgrade::new(&self.name, self.spec);
        upgrade.metadata.namespace = Some(self.namespace);
        upgrade.metadata.uid = self.uid;
        upgrade.metadata.generation = Some(1);
        upgrade.status = self.status;
        upgrade
    }
}

// =============================================================================
// Instance StatefulSet Builder
// =============================================================================

pub struct InstanceBuilder {
    name: String,
    cluster: String,
    replicas: i32,
    containers: Vec<Container>,
}

impl InstanceBuilder {
    /// An instance with a single `database` container mounting `/pgdata`
    pub fn new(name: &str, cluster: &str) -> Self {
        Self {
            name: name.to_string(),
            cluster: cluster.to_string(),
            replicas: 1,
            containers: vec![Container {
                name: "database".to_string(),
                image: Some("postgres:15".to_string()),
                security_context: Some(SecurityContext {
                    privileged: Some(false),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: "postgres-data".to_string(),
                    mount_path: "/pgdata".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
        }
    }

    pub fn replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_sidecar(mut self, name: &str) -> Self {
        self.containers.push(Container {
            name: name.to_string(),
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> StatefulSet {
        let instance_labels = BTreeMap::from([
            (labels::CLUSTER.to_string(), self.cluster),
            (labels::DATA.to_string(), labels::DATA_POSTGRES.to_string()),
        ]);

        StatefulSet {
            metadata: ObjectMeta {
                name: Some(self.name),
                labels: Some(instance_labels),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(self.replicas),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: self.containers,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}
