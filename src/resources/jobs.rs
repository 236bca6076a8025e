//! Job generation for PGUpgrade
//!
//! Both generated jobs run inside a copy of the database pod: the pod spec
//! of an instance StatefulSet is cloned so the job sees the same volumes,
//! service account and pod security context, and the containers are replaced
//! by a single `database` container that runs one of the fixed scripts.
//!
//! Generation is a pure function of the PGUpgrade and the StatefulSet.
//! The same inputs always produce the same Job, which is what lets the
//! reconciler look jobs up by name instead of tracking them in status.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, LocalObjectReference, PodSpec, PodTemplateSpec,
    ResourceRequirements as K8sResourceRequirements, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::api::ObjectMeta;

use crate::crd::{PGUpgrade, ResourceList, annotations, labels};
use crate::resources::common::{owner_reference, upgrade_labels};
use crate::resources::quantity::canonical_quantity;
use crate::resources::scripts::{
    ARG_REMOVE, ARG_UPGRADE, REMOVE_DATA_SCRIPT, UPGRADE_SCRIPT, command,
};

/// Name of the database container in instance pods and generated jobs
pub const CONTAINER_DATABASE: &str = "database";

/// Deterministic name of the upgrade job
pub fn upgrade_job_name(upgrade: &PGUpgrade) -> String {
    format!("{}-pgdata", upgrade.name_any())
}

/// Deterministic name of the removal job for one instance StatefulSet
pub fn remove_data_job_name(upgrade: &PGUpgrade, sts: &StatefulSet) -> String {
    format!("{}-{}", upgrade.name_any(), sts.name_any())
}

/// Labels of the upgrade job; the only generated labels carrying a version
pub fn upgrade_job_labels(upgrade: &PGUpgrade) -> BTreeMap<String, String> {
    let mut job_labels = upgrade_labels(upgrade, labels::ROLE_PGUPGRADE);
    job_labels.insert(
        labels::VERSION.to_string(),
        upgrade.spec.to_postgres_version.to_string(),
    );
    job_labels
}

/// Labels of a removal job
pub fn remove_data_job_labels(upgrade: &PGUpgrade) -> BTreeMap<String, String> {
    upgrade_labels(upgrade, labels::ROLE_REMOVEDATA)
}

/// Generate the job that runs `pg_upgrade` against the startup instance's volume.
///
/// Command arguments: `upgrade <from> <to>`.
pub fn generate_upgrade_job(upgrade: &PGUpgrade, startup: &StatefulSet) -> Job {
    let args = vec![
        ARG_UPGRADE.to_string(),
        upgrade.spec.from_postgres_version.to_string(),
        upgrade.spec.to_postgres_version.to_string(),
    ];

    let mut job = generate_job(
        upgrade,
        startup,
        upgrade_job_name(upgrade),
        upgrade_job_labels(upgrade),
        command(UPGRADE_SCRIPT, &args),
    );
    job.metadata.annotations = Some(BTreeMap::from([(
        annotations::INSTANCE.to_string(),
        startup.name_any(),
    )]));
    job
}

/// Instance an upgrade job was generated from
pub fn upgrade_job_instance(job: &Job) -> Option<String> {
    job.annotations().get(annotations::INSTANCE).cloned()
}

/// Generate the job that removes the superseded data directory of `sts`.
///
/// Command arguments: `remove <from>`.
pub fn generate_remove_data_job(upgrade: &PGUpgrade, sts: &StatefulSet) -> Job {
    let args = vec![
        ARG_REMOVE.to_string(),
        upgrade.spec.from_postgres_version.to_string(),
    ];

    generate_job(
        upgrade,
        sts,
        remove_data_job_name(upgrade, sts),
        remove_data_job_labels(upgrade),
        command(REMOVE_DATA_SCRIPT, &args),
    )
}

/// Find the database container in a StatefulSet's pod template
pub fn database_container(sts: &StatefulSet) -> Option<&Container> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == CONTAINER_DATABASE))
}

fn generate_job(
    upgrade: &PGUpgrade,
    reference: &StatefulSet,
    name: String,
    job_labels: BTreeMap<String, String>,
    command: Vec<String>,
) -> Job {
    let reference_container = database_container(reference);

    let container = Container {
        name: CONTAINER_DATABASE.to_string(),
        image: Some(upgrade.spec.image.clone()),
        image_pull_policy: upgrade.spec.image_pull_policy.clone(),
        command: Some(command),
        resources: job_resources(upgrade),
        security_context: Some(unprivileged(
            reference_container.and_then(|c| c.security_context.clone()),
        )),
        volume_mounts: reference_container.and_then(|c| c.volume_mounts.clone()),
        ..Default::default()
    };

    let mut pod_spec: PodSpec = reference
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.clone())
        .unwrap_or_default();

    pod_spec.containers = vec![container];
    pod_spec.init_containers = None;
    pod_spec.ephemeral_containers = None;
    pod_spec.restart_policy = Some("Never".to_string());

    // Scheduling comes from the PGUpgrade, never from the instance
    pod_spec.affinity = upgrade.spec.affinity.clone();
    pod_spec.tolerations = non_empty(upgrade.spec.tolerations.clone());
    pod_spec.priority_class_name = upgrade.spec.priority_class_name.clone();
    pod_spec.image_pull_secrets = non_empty(
        upgrade
            .spec
            .image_pull_secrets
            .iter()
            .map(|s| LocalObjectReference {
                name: s.name.clone(),
            })
            .collect(),
    );

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: upgrade.namespace(),
            labels: Some(job_labels.clone()),
            owner_references: Some(vec![owner_reference(upgrade)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(job_labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Copy a security context with privilege forced off
fn unprivileged(reference: Option<SecurityContext>) -> SecurityContext {
    SecurityContext {
        privileged: Some(false),
        ..reference.unwrap_or_default()
    }
}

/// Resource requirements for generated jobs, in canonical quantity form
pub fn job_resources(upgrade: &PGUpgrade) -> Option<K8sResourceRequirements> {
    upgrade
        .spec
        .resources
        .as_ref()
        .map(|r| K8sResourceRequirements {
            limits: r.limits.as_ref().and_then(resource_map),
            requests: r.requests.as_ref().and_then(resource_map),
            ..Default::default()
        })
}

fn resource_map(list: &ResourceList) -> Option<BTreeMap<String, Quantity>> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), normalize(cpu));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), normalize(memory));
    }
    if map.is_empty() { None } else { Some(map) }
}

/// Quantities are validated before any job is generated; anything that
/// still fails to parse is passed through for the API server to reject.
fn normalize(value: &str) -> Quantity {
    canonical_quantity(value).unwrap_or_else(|_| Quantity(value.to_string()))
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() { None } else { Some(items) }
}
