//! Reconciler for PGUpgrade resources
//!
//! Each reconcile observes the cluster and the generated jobs, asks the state
//! machine for a decision, records it on status and performs at most one
//! action. Nothing is carried between reconciles except what is on status:
//! jobs are found again by their deterministic names.
//!
//! ## Overview
//!
//! 1. Validate the spec and locate the cluster's instance StatefulSets
//! 2. Scale the cluster to zero through the availability guard
//! 3. Run the upgrade job against the startup instance's volume
//! 4. Check the job produced the requested version
//! 5. Remove the superseded data directories of the other instances
//! 6. Restore the cluster's previous replica count

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::availability::{
    ClusterAvailability, ClusterTarget, StatefulSetAvailability,
};
use crate::controller::error::{UpgradeBackoffConfig, UpgradeError, UpgradeResult};
use crate::controller::state_machine::{
    JobState, RemovalJob, ReplicaCounts, UpgradeAction, UpgradeDecision, UpgradeStateMachine,
    UpgradeTransitionContext, decide,
};
use crate::controller::status::{PinnedObservation, StatusManager, next_status};
use crate::controller::validation::validate_upgrade;
use crate::crd::{PGUpgrade, UpgradePhase, labels};
use crate::health::HealthState;
use crate::resources::common::{instance_selector, primary_selector};
use crate::resources::jobs::{
    database_container, generate_remove_data_job, generate_upgrade_job, remove_data_job_name,
    upgrade_job_instance, upgrade_job_name,
};

/// Context for the upgrade reconciler
pub struct UpgradeContext {
    pub client: Client,
    /// Guard used to observe and change the cluster's replica count
    pub availability: Arc<dyn ClusterAvailability>,
    pub state_machine: UpgradeStateMachine,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
}

impl UpgradeContext {
    /// Context backed by the cluster's instance StatefulSets
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        let availability = Arc::new(StatefulSetAvailability::new(client.clone()));
        Self::with_availability(client, availability, health_state)
    }

    /// Context with a caller-supplied availability guard
    pub fn with_availability(
        client: Client,
        availability: Arc<dyn ClusterAvailability>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            availability,
            state_machine: UpgradeStateMachine::new(),
            health_state,
        }
    }
}

/// Everything read from the API server during one reconcile
#[derive(Debug, Clone, Default)]
pub struct ClusterObservation {
    /// Instance StatefulSets sorted by name
    pub instances: Vec<StatefulSet>,
    /// Instance owning the pod labelled as primary
    pub primary_instance: Option<String>,
    pub replicas: ReplicaCounts,
    /// Jobs labelled with this PGUpgrade, by name
    pub jobs: BTreeMap<String, Job>,
}

/// Main reconciliation function for PGUpgrade
#[instrument(skip(upgrade, ctx), fields(name = %upgrade.name_any(), namespace = upgrade.namespace().unwrap_or_default()))]
pub async fn reconcile_upgrade(
    upgrade: Arc<PGUpgrade>,
    ctx: Arc<UpgradeContext>,
) -> Result<Action, UpgradeError> {
    let start_time = std::time::Instant::now();
    let ns = upgrade.namespace().unwrap_or_default();
    let name = upgrade.name_any();

    let current_phase = upgrade.phase();
    if current_phase.is_terminal() {
        debug!(phase = %current_phase, "Upgrade is finished, nothing to do");
        return Ok(Action::await_change());
    }

    info!(phase = %current_phase, "Reconciling PGUpgrade");

    let result = reconcile_phase(&upgrade, &ctx, &ns, current_phase).await;

    if let Some(ref health) = ctx.health_state {
        match &result {
            Ok(_) => {
                health
                    .metrics
                    .record_reconcile(&ns, &name, start_time.elapsed().as_secs_f64());
                health.touch_reconcile();
            }
            Err(_) => health.metrics.record_error(&ns, &name),
        }
    }

    if let Err(ref e) = result
        && let Err(status_err) = StatusManager::new(&upgrade, &ctx.client, &ns)
            .record_error(&e.to_string())
            .await
    {
        warn!("Failed to record error on status: {}", status_err);
    }

    debug!(
        "Reconciliation completed in {:.3}s",
        start_time.elapsed().as_secs_f64()
    );

    result
}

async fn reconcile_phase(
    upgrade: &PGUpgrade,
    ctx: &UpgradeContext,
    ns: &str,
    current_phase: UpgradePhase,
) -> UpgradeResult<Action> {
    let cluster = upgrade.spec.postgres_cluster_name.clone();
    let observation = observe(upgrade, ctx, ns).await?;
    let (transition_ctx, pinned) = build_transition_context(upgrade, &observation);

    let decision = decide(&ctx.state_machine, current_phase, &transition_ctx);

    if decision.phase != current_phase {
        info!(
            "Phase transition: {} -> {} ({})",
            current_phase, decision.phase, decision.message
        );
        if let Some(ref health) = ctx.health_state {
            health
                .metrics
                .record_transition(&current_phase.to_string(), &decision.phase.to_string());
        }
    } else {
        debug!(phase = %decision.phase, "{}", decision.message);
    }

    if let Some(ref health) = ctx.health_state {
        health.metrics.set_cluster_replicas(
            ns,
            &upgrade.name_any(),
            i64::from(transition_ctx.desired_replicas),
            i64::from(transition_ctx.replicas.ready),
        );
    }

    // Status is written before acting so the pinned startup instance and
    // replica count survive a failed action
    let status = next_status(upgrade, &decision, &pinned);
    StatusManager::new(upgrade, &ctx.client, ns)
        .update(&status)
        .await?;

    if let Some(ref action) = decision.action {
        let target = ClusterTarget {
            namespace: ns.to_string(),
            cluster,
            startup_instance: status.startup_instance.clone(),
        };
        execute_action(upgrade, ctx, &target, &observation, action).await?;
    }

    Ok(next_action(&decision))
}

/// Read the cluster and the jobs generated for this upgrade
async fn observe(
    upgrade: &PGUpgrade,
    ctx: &UpgradeContext,
    ns: &str,
) -> UpgradeResult<ClusterObservation> {
    let cluster = &upgrade.spec.postgres_cluster_name;

    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    let mut instances = sts_api
        .list(&ListParams::default().labels(&instance_selector(cluster)))
        .await?
        .items;
    instances.sort_by_key(|sts| sts.name_any());

    let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let primary_instance = pod_api
        .list(&ListParams::default().labels(&primary_selector(cluster)))
        .await?
        .items
        .iter()
        .find_map(owning_statefulset);

    let target = ClusterTarget {
        namespace: ns.to_string(),
        cluster: cluster.clone(),
        startup_instance: upgrade
            .status
            .as_ref()
            .and_then(|s| s.startup_instance.clone()),
    };
    let replicas = ctx.availability.observe_ready_replicas(&target).await?;

    let job_api: Api<Job> = Api::namespaced(ctx.client.clone(), ns);
    let jobs = job_api
        .list(
            &ListParams::default()
                .labels(&format!("{}={}", labels::PGUPGRADE, upgrade.name_any())),
        )
        .await?
        .items
        .into_iter()
        .map(|job| (job.name_any(), job))
        .collect();

    Ok(ClusterObservation {
        instances,
        primary_instance,
        replicas,
        jobs,
    })
}

/// Name of the StatefulSet that owns a pod
fn owning_statefulset(pod: &Pod) -> Option<String> {
    pod.owner_references()
        .iter()
        .find(|o| o.kind == "StatefulSet")
        .map(|o| o.name.clone())
}

/// Instance whose volume is upgraded.
///
/// Once recorded on status it never changes. Without status the instance
/// stamped on an existing upgrade job wins, then the current primary, then
/// the first instance by name.
pub fn select_startup_instance(
    upgrade: &PGUpgrade,
    observation: &ClusterObservation,
) -> Option<String> {
    if let Some(pinned) = upgrade
        .status
        .as_ref()
        .and_then(|s| s.startup_instance.clone())
    {
        return Some(pinned);
    }

    let is_instance = |name: &String| {
        observation
            .instances
            .iter()
            .any(|sts| sts.name_any() == *name)
    };

    observation
        .jobs
        .get(&upgrade_job_name(upgrade))
        .and_then(upgrade_job_instance)
        .filter(is_instance)
        .or_else(|| observation.primary_instance.clone().filter(is_instance))
        .or_else(|| observation.instances.first().map(|sts| sts.name_any()))
}

/// Replica count to restore once the upgrade completes
pub fn desired_replicas(upgrade: &PGUpgrade, observation: &ClusterObservation) -> i32 {
    if let Some(desired) = upgrade.status.as_ref().and_then(|s| s.desired_replicas) {
        return desired;
    }

    let instance_count = i32::try_from(observation.instances.len()).unwrap_or(i32::MAX);
    if upgrade.phase() == UpgradePhase::Pending && observation.replicas.requested > 0 {
        observation.replicas.requested
    } else {
        instance_count
    }
}

/// Observed state of a job from its conditions and pod counts
pub fn job_state(job: &Job) -> JobState {
    let Some(status) = job.status.as_ref() else {
        return JobState::Running;
    };

    let has_condition = |type_: &str| {
        status
            .conditions
            .as_ref()
            .is_some_and(|cs| cs.iter().any(|c| c.type_ == type_ && c.status == "True"))
    };

    if has_condition("Complete") {
        JobState::Succeeded
    } else if has_condition("Failed") {
        JobState::Failed
    } else if status.succeeded.unwrap_or(0) > 0 {
        JobState::Succeeded
    } else if status.failed.unwrap_or(0) > 0 {
        JobState::Failed
    } else {
        JobState::Running
    }
}

fn observed_job_state(job: Option<&Job>) -> JobState {
    job.map(job_state).unwrap_or_default()
}

/// Destination version recorded on an upgrade job's labels
pub fn job_version(job: &Job) -> Option<i32> {
    job.labels()
        .get(labels::VERSION)
        .and_then(|v| v.parse().ok())
}

/// Build the transition context and the values to pin on status
pub fn build_transition_context(
    upgrade: &PGUpgrade,
    observation: &ClusterObservation,
) -> (UpgradeTransitionContext, PinnedObservation) {
    let startup_instance = select_startup_instance(upgrade, observation);
    let desired = desired_replicas(upgrade, observation);

    let upgrade_job_name = upgrade_job_name(upgrade);
    let upgrade_job = observation.jobs.get(&upgrade_job_name);

    let removal_jobs = observation
        .instances
        .iter()
        .filter(|sts| Some(sts.name_any()) != startup_instance)
        .map(|sts| {
            let job = remove_data_job_name(upgrade, sts);
            RemovalJob {
                instance: sts.name_any(),
                state: observed_job_state(observation.jobs.get(&job)),
                job,
            }
        })
        .collect();

    let ctx = UpgradeTransitionContext {
        validation_error: validation_error(upgrade, observation, startup_instance.as_deref()),
        replicas: observation.replicas,
        desired_replicas: desired,
        upgrade_job_name,
        upgrade_job: observed_job_state(upgrade_job),
        upgrade_job_version: upgrade_job.and_then(job_version),
        to_version: upgrade.spec.to_postgres_version,
        removal_jobs,
    };

    let pinned = PinnedObservation {
        startup_instance,
        desired_replicas: Some(desired),
    };

    (ctx, pinned)
}

/// Reason the upgrade cannot proceed until the PGUpgrade or cluster changes
fn validation_error(
    upgrade: &PGUpgrade,
    observation: &ClusterObservation,
    startup_instance: Option<&str>,
) -> Option<String> {
    if let Err(e) = validate_upgrade(upgrade) {
        return Some(e.to_string());
    }

    let Some(startup) = startup_instance else {
        return Some(
            UpgradeError::ClusterNotFound {
                namespace: upgrade.namespace().unwrap_or_default(),
                name: upgrade.spec.postgres_cluster_name.clone(),
            }
            .to_string(),
        );
    };

    let missing_template = match observation
        .instances
        .iter()
        .find(|sts| sts.name_any() == startup)
    {
        Some(sts) => database_container(sts).is_none(),
        None => true,
    };

    missing_template.then(|| {
        UpgradeError::MissingReferenceTemplate {
            statefulset: startup.to_string(),
        }
        .to_string()
    })
}

/// Perform a single action chosen by the state machine
async fn execute_action(
    upgrade: &PGUpgrade,
    ctx: &UpgradeContext,
    target: &ClusterTarget,
    observation: &ClusterObservation,
    action: &UpgradeAction,
) -> UpgradeResult<()> {
    info!(%action, "Executing upgrade action");

    match action {
        UpgradeAction::RequestReplicas(replicas) => {
            ctx.availability.request_replicas(target, *replicas).await
        }
        UpgradeAction::CreateUpgradeJob => {
            let startup = target
                .startup_instance
                .as_deref()
                .ok_or(UpgradeError::MissingObjectKey("status.startupInstance"))?;
            let sts = find_instance(observation, startup)?;
            create_job(ctx, &target.namespace, generate_upgrade_job(upgrade, sts)).await?;
            record_job_created(ctx, labels::ROLE_PGUPGRADE);
            Ok(())
        }
        UpgradeAction::CreateRemoveDataJob { instance } => {
            let sts = find_instance(observation, instance)?;
            create_job(
                ctx,
                &target.namespace,
                generate_remove_data_job(upgrade, sts),
            )
            .await?;
            record_job_created(ctx, labels::ROLE_REMOVEDATA);
            Ok(())
        }
    }
}

fn find_instance<'a>(
    observation: &'a ClusterObservation,
    name: &str,
) -> UpgradeResult<&'a StatefulSet> {
    observation
        .instances
        .iter()
        .find(|sts| sts.name_any() == name)
        .ok_or_else(|| UpgradeError::MissingReferenceTemplate {
            statefulset: name.to_string(),
        })
}

/// Create a job, treating an existing job with the same name as success
async fn create_job(ctx: &UpgradeContext, ns: &str, job: Job) -> UpgradeResult<()> {
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), ns);
    let name = job.name_any();

    match api.create(&PostParams::default(), &job).await {
        Ok(_) => {
            info!(job = %name, "Created job");
            Ok(())
        }
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
            debug!(job = %name, "Job already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn record_job_created(ctx: &UpgradeContext, role: &str) {
    if let Some(ref health) = ctx.health_state {
        health.metrics.record_job_created(role);
    }
}

/// Requeue behaviour after a decision has been recorded
pub fn next_action(decision: &UpgradeDecision) -> Action {
    if decision.phase.is_terminal() || decision.awaits_edit() {
        Action::await_change()
    } else {
        Action::requeue(requeue_duration_for_phase(&decision.phase))
    }
}

/// Error policy for the upgrade controller
pub fn upgrade_error_policy(
    upgrade: Arc<PGUpgrade>,
    error: &UpgradeError,
    _ctx: Arc<UpgradeContext>,
) -> Action {
    let name = upgrade.name_any();
    let backoff = UpgradeBackoffConfig::default();

    let retry_count = upgrade
        .status
        .as_ref()
        .and_then(|s| s.retry_count)
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or(0);

    let delay = backoff.delay_for_error(error, retry_count);

    if error.is_permanent() {
        error!(
            "Permanent error for upgrade {}: {:?}, not retrying automatically",
            name, error
        );
    } else if error.is_retryable() {
        warn!(
            "Retryable error for upgrade {} (retry #{}): {:?}, requeuing in {:?}",
            name, retry_count, error, delay
        );
    } else {
        warn!(
            "Unexpected error for upgrade {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// Get appropriate requeue duration for a phase
pub fn requeue_duration_for_phase(phase: &UpgradePhase) -> Duration {
    match phase {
        UpgradePhase::Pending => Duration::from_secs(5),
        UpgradePhase::ScalingDown => Duration::from_secs(5),
        UpgradePhase::Upgrading => Duration::from_secs(15),
        UpgradePhase::Validating => Duration::from_secs(5),
        UpgradePhase::RemovingOldData => Duration::from_secs(10),
        UpgradePhase::ScalingUp => Duration::from_secs(10),
        UpgradePhase::Succeeded => Duration::from_secs(300),
        UpgradePhase::Failed => Duration::from_secs(300),
    }
}
