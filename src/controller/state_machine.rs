//! Finite state machine for the PGUpgrade lifecycle
//!
//! The machine has two layers. A transition table with guards decides which
//! phase changes are legal. On top of it, [`decide`] turns an observation of
//! the cluster and the generated jobs into the next phase plus at most one
//! action for the reconciler to perform.
//!
//! [`decide`] is a pure function. It reads nothing but its arguments, so the
//! reconciler can call it after a restart, a requeue or a watch event and get
//! the same answer for the same observation.
//!
//! ## Phase Flow
//!
//! ```text
//! Pending → ScalingDown → Upgrading → Validating → RemovingOldData → ScalingUp → Succeeded
//!    ↓           ↓            ↓           ↓
//!  Failed      Failed       Failed      Failed
//! ```
//!
//! A failed removal job does not lead to `Failed`: the upgrade stalls in
//! `RemovingOldData` with the old data still on disk and the cluster down.

use std::fmt;

use crate::controller::error::UpgradeError;
use crate::controller::status::condition_types;
use crate::crd::UpgradePhase;

/// Events that trigger state transitions in the upgrade lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpgradeEvent {
    /// Spec and cluster passed validation
    ValidationPassed,
    /// No instance is requested or ready
    ClusterQuiesced,
    /// The upgrade job completed
    UpgradeJobSucceeded,
    /// The upgrade job failed
    UpgradeJobFailed,
    /// The completed upgrade job targeted the requested version
    PostCheckPassed,
    /// The upgrade job is gone or targeted another version
    PostCheckFailed,
    /// Every removal job completed
    OldDataRemoved,
    /// The cluster is back at its desired replica count
    ClusterRestored,
}

impl fmt::Display for UpgradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeEvent::ValidationPassed => write!(f, "ValidationPassed"),
            UpgradeEvent::ClusterQuiesced => write!(f, "ClusterQuiesced"),
            UpgradeEvent::UpgradeJobSucceeded => write!(f, "UpgradeJobSucceeded"),
            UpgradeEvent::UpgradeJobFailed => write!(f, "UpgradeJobFailed"),
            UpgradeEvent::PostCheckPassed => write!(f, "PostCheckPassed"),
            UpgradeEvent::PostCheckFailed => write!(f, "PostCheckFailed"),
            UpgradeEvent::OldDataRemoved => write!(f, "OldDataRemoved"),
            UpgradeEvent::ClusterRestored => write!(f, "ClusterRestored"),
        }
    }
}

/// Observed state of a generated job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    /// No job with the expected name exists
    #[default]
    Missing,
    /// The job exists and has not finished
    Running,
    /// The job reports a Complete condition
    Succeeded,
    /// The job reports a Failed condition
    Failed,
}

/// Replica counts summed across the cluster's instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicaCounts {
    /// Replicas requested in the instances' specs
    pub requested: i32,
    /// Replicas reported ready
    pub ready: i32,
}

/// A removal job and the instance it cleans up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalJob {
    /// Name of the instance StatefulSet
    pub instance: String,
    /// Deterministic name of the removal job
    pub job: String,
    /// Observed state of the job
    pub state: JobState,
}

/// Context information available during upgrade state transitions
#[derive(Debug, Clone, Default)]
pub struct UpgradeTransitionContext {
    /// Validation failure for the spec or the cluster it names
    pub validation_error: Option<String>,
    /// Observed replica counts
    pub replicas: ReplicaCounts,
    /// Replica count to restore once the upgrade is done
    pub desired_replicas: i32,
    /// Deterministic name of the upgrade job
    pub upgrade_job_name: String,
    /// Observed state of the upgrade job
    pub upgrade_job: JobState,
    /// Version label carried by the existing upgrade job
    pub upgrade_job_version: Option<i32>,
    /// Destination version requested by the PGUpgrade
    pub to_version: i32,
    /// Removal jobs, one per instance other than the startup instance
    pub removal_jobs: Vec<RemovalJob>,
}

impl UpgradeTransitionContext {
    /// No instance is requested or ready
    pub fn is_quiesced(&self) -> bool {
        self.replicas.requested == 0 && self.replicas.ready == 0
    }

    /// The upgrade job completed and targeted the requested version.
    ///
    /// The upgrade script only exits zero once `pg_controldata` reports the
    /// new data directory as shut down, so a completed job attests that the
    /// destination directory exists and is clean. The version label catches
    /// a job left over from a PGUpgrade whose destination was edited.
    pub fn post_check_passed(&self) -> bool {
        self.upgrade_job == JobState::Succeeded && self.upgrade_job_version == Some(self.to_version)
    }

    /// First removal job that failed
    pub fn failed_removal(&self) -> Option<&RemovalJob> {
        self.removal_jobs
            .iter()
            .find(|j| j.state == JobState::Failed)
    }

    /// First removal job that does not exist yet
    pub fn next_missing_removal(&self) -> Option<&RemovalJob> {
        self.removal_jobs
            .iter()
            .find(|j| j.state == JobState::Missing)
    }

    /// Every removal job completed
    pub fn all_removals_succeeded(&self) -> bool {
        self.removal_jobs
            .iter()
            .all(|j| j.state == JobState::Succeeded)
    }

    /// The cluster has been asked for, and reports, its desired replicas
    pub fn cluster_restored(&self) -> bool {
        self.replicas.requested == self.desired_replicas
            && self.replicas.ready >= self.desired_replicas
    }
}

/// A state transition definition for upgrade phases
#[derive(Debug)]
pub struct UpgradeTransition {
    /// Source phase
    pub from: UpgradePhase,
    /// Target phase
    pub to: UpgradePhase,
    /// Event that triggers this transition
    pub event: UpgradeEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl UpgradeTransition {
    /// Create a new transition
    const fn new(
        from: UpgradePhase,
        to: UpgradePhase,
        event: UpgradeEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting an upgrade state transition
#[derive(Debug)]
pub enum UpgradeTransitionResult {
    /// Transition was successful
    Success {
        from: UpgradePhase,
        to: UpgradePhase,
        event: UpgradeEvent,
        description: &'static str,
    },
    /// Transition was not valid for current phase
    InvalidTransition {
        current: UpgradePhase,
        event: UpgradeEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: UpgradePhase,
        to: UpgradePhase,
        event: UpgradeEvent,
        reason: String,
    },
}

/// Formal state machine for the PGUpgrade lifecycle
pub struct UpgradeStateMachine {
    transitions: Vec<UpgradeTransition>,
}

impl Default for UpgradeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeStateMachine {
    /// Create a new upgrade state machine with the defined transition table
    pub fn new() -> Self {
        Self {
            transitions: vec![
                // === Pending state transitions ===
                UpgradeTransition::new(
                    UpgradePhase::Pending,
                    UpgradePhase::ScalingDown,
                    UpgradeEvent::ValidationPassed,
                    "Validation passed, scaling the cluster down",
                ),
                UpgradeTransition::new(
                    UpgradePhase::Pending,
                    UpgradePhase::Failed,
                    UpgradeEvent::UpgradeJobFailed,
                    "A failed upgrade job already exists",
                ),
                // === ScalingDown state transitions ===
                UpgradeTransition::new(
                    UpgradePhase::ScalingDown,
                    UpgradePhase::Upgrading,
                    UpgradeEvent::ClusterQuiesced,
                    "Cluster quiesced, running pg_upgrade",
                ),
                UpgradeTransition::new(
                    UpgradePhase::ScalingDown,
                    UpgradePhase::Failed,
                    UpgradeEvent::UpgradeJobFailed,
                    "A failed upgrade job already exists",
                ),
                // === Upgrading state transitions ===
                UpgradeTransition::new(
                    UpgradePhase::Upgrading,
                    UpgradePhase::Validating,
                    UpgradeEvent::UpgradeJobSucceeded,
                    "Upgrade job completed, validating result",
                ),
                UpgradeTransition::new(
                    UpgradePhase::Upgrading,
                    UpgradePhase::Failed,
                    UpgradeEvent::UpgradeJobFailed,
                    "Upgrade job failed",
                ),
                // === Validating state transitions ===
                UpgradeTransition::new(
                    UpgradePhase::Validating,
                    UpgradePhase::RemovingOldData,
                    UpgradeEvent::PostCheckPassed,
                    "Upgrade verified, removing old data directories",
                ),
                UpgradeTransition::new(
                    UpgradePhase::Validating,
                    UpgradePhase::Failed,
                    UpgradeEvent::PostCheckFailed,
                    "Upgrade result did not match the requested version",
                ),
                UpgradeTransition::new(
                    UpgradePhase::Validating,
                    UpgradePhase::Failed,
                    UpgradeEvent::UpgradeJobFailed,
                    "Upgrade job failed",
                ),
                // === RemovingOldData state transitions ===
                // Removal failures stall here instead of failing the upgrade
                UpgradeTransition::new(
                    UpgradePhase::RemovingOldData,
                    UpgradePhase::ScalingUp,
                    UpgradeEvent::OldDataRemoved,
                    "Old data removed, scaling the cluster up",
                ),
                // === ScalingUp state transitions ===
                UpgradeTransition::new(
                    UpgradePhase::ScalingUp,
                    UpgradePhase::Succeeded,
                    UpgradeEvent::ClusterRestored,
                    "Cluster restored, upgrade complete",
                ),
                // === Succeeded and Failed are terminal ===
            ],
        }
    }

    /// Attempt to transition to a new phase based on an event
    pub fn transition(
        &self,
        current: &UpgradePhase,
        event: UpgradeEvent,
        ctx: &UpgradeTransitionContext,
    ) -> UpgradeTransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    UpgradeTransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    UpgradeTransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => UpgradeTransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &UpgradePhase, event: &UpgradeEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given phase
    pub fn valid_events(&self, phase: &UpgradePhase) -> Vec<&UpgradeEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *phase)
            .map(|t| &t.event)
            .collect()
    }

    /// Check guard conditions for a transition
    fn check_guard(
        &self,
        transition: &UpgradeTransition,
        ctx: &UpgradeTransitionContext,
    ) -> Option<String> {
        match (&transition.from, &transition.to, &transition.event) {
            (_, UpgradePhase::ScalingDown, UpgradeEvent::ValidationPassed) => {
                ctx.validation_error.clone()
            }

            // The data directory must not be touched while any instance may run
            (_, UpgradePhase::Upgrading, UpgradeEvent::ClusterQuiesced) => {
                if !ctx.is_quiesced() {
                    Some(format!(
                        "Cluster not quiesced: {} requested, {} ready",
                        ctx.replicas.requested, ctx.replicas.ready
                    ))
                } else {
                    None
                }
            }

            (_, UpgradePhase::Validating, UpgradeEvent::UpgradeJobSucceeded) => {
                if ctx.upgrade_job != JobState::Succeeded {
                    Some("Upgrade job has not completed".to_string())
                } else {
                    None
                }
            }

            (_, UpgradePhase::RemovingOldData, UpgradeEvent::PostCheckPassed) => {
                if !ctx.post_check_passed() {
                    Some("Upgrade job did not complete for the requested version".to_string())
                } else {
                    None
                }
            }

            (_, UpgradePhase::ScalingUp, UpgradeEvent::OldDataRemoved) => {
                if !ctx.all_removals_succeeded() {
                    Some("Removal jobs have not all completed".to_string())
                } else {
                    None
                }
            }

            (_, UpgradePhase::Succeeded, UpgradeEvent::ClusterRestored) => {
                if !ctx.cluster_restored() {
                    Some(format!(
                        "Cluster not restored: {}/{} ready",
                        ctx.replicas.ready, ctx.desired_replicas
                    ))
                } else {
                    None
                }
            }

            _ => None,
        }
    }
}

/// Determine the appropriate event based on upgrade context
pub fn determine_upgrade_event(
    current_phase: &UpgradePhase,
    ctx: &UpgradeTransitionContext,
) -> Option<UpgradeEvent> {
    if ctx.validation_error.is_some() {
        return None;
    }

    match current_phase {
        UpgradePhase::Pending => {
            if ctx.upgrade_job == JobState::Failed {
                Some(UpgradeEvent::UpgradeJobFailed)
            } else {
                Some(UpgradeEvent::ValidationPassed)
            }
        }

        UpgradePhase::ScalingDown => {
            if ctx.upgrade_job == JobState::Failed {
                Some(UpgradeEvent::UpgradeJobFailed)
            } else if ctx.is_quiesced() {
                Some(UpgradeEvent::ClusterQuiesced)
            } else {
                None
            }
        }

        UpgradePhase::Upgrading => match ctx.upgrade_job {
            JobState::Succeeded => Some(UpgradeEvent::UpgradeJobSucceeded),
            JobState::Failed => Some(UpgradeEvent::UpgradeJobFailed),
            JobState::Missing | JobState::Running => None,
        },

        UpgradePhase::Validating => match ctx.upgrade_job {
            JobState::Failed => Some(UpgradeEvent::UpgradeJobFailed),
            JobState::Running => None,
            JobState::Succeeded | JobState::Missing => {
                if ctx.post_check_passed() {
                    Some(UpgradeEvent::PostCheckPassed)
                } else {
                    Some(UpgradeEvent::PostCheckFailed)
                }
            }
        },

        UpgradePhase::RemovingOldData => {
            if ctx.all_removals_succeeded() {
                Some(UpgradeEvent::OldDataRemoved)
            } else {
                None
            }
        }

        UpgradePhase::ScalingUp => {
            if ctx.cluster_restored() {
                Some(UpgradeEvent::ClusterRestored)
            } else {
                None
            }
        }

        UpgradePhase::Succeeded | UpgradePhase::Failed => None,
    }
}

/// A mutation the reconciler performs on behalf of a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeAction {
    /// Ask the cluster to run this many instances
    RequestReplicas(i32),
    /// Create the upgrade job from the startup instance
    CreateUpgradeJob,
    /// Create the removal job for one instance
    CreateRemoveDataJob { instance: String },
}

impl fmt::Display for UpgradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeAction::RequestReplicas(n) => write!(f, "RequestReplicas({n})"),
            UpgradeAction::CreateUpgradeJob => write!(f, "CreateUpgradeJob"),
            UpgradeAction::CreateRemoveDataJob { instance } => {
                write!(f, "CreateRemoveDataJob({instance})")
            }
        }
    }
}

/// A condition the reconciler should record on status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub type_: &'static str,
    pub status: bool,
    pub reason: &'static str,
    pub message: String,
}

impl ConditionUpdate {
    fn new(type_: &'static str, status: bool, reason: &'static str, message: String) -> Self {
        Self {
            type_,
            status,
            reason,
            message,
        }
    }
}

/// Outcome of evaluating one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeDecision {
    /// Phase to record on status
    pub phase: UpgradePhase,
    /// Event that moved the phase, if any
    pub event: Option<UpgradeEvent>,
    /// Transition description or the reason the phase is holding
    pub message: String,
    /// At most one mutation to perform
    pub action: Option<UpgradeAction>,
    /// Conditions to record on status
    pub conditions: Vec<ConditionUpdate>,
}

impl UpgradeDecision {
    /// The upgrade is blocked on an edit to the PGUpgrade
    pub fn awaits_edit(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == condition_types::VALID_SPEC && !c.status)
    }
}

/// Decide the next phase and action for an observation.
///
/// At most one transition is taken per call; the action is chosen for the
/// phase after that transition.
pub fn decide(
    machine: &UpgradeStateMachine,
    current: UpgradePhase,
    ctx: &UpgradeTransitionContext,
) -> UpgradeDecision {
    if current.is_terminal() {
        return UpgradeDecision {
            phase: current,
            event: None,
            message: format!("Upgrade {}", current),
            action: None,
            conditions: Vec::new(),
        };
    }

    if let Some(reason) = &ctx.validation_error {
        return UpgradeDecision {
            phase: current,
            event: None,
            message: reason.clone(),
            action: None,
            conditions: vec![ConditionUpdate::new(
                condition_types::VALID_SPEC,
                false,
                "InvalidSpec",
                reason.clone(),
            )],
        };
    }

    let (phase, event, message) = match determine_upgrade_event(&current, ctx) {
        Some(event) => match machine.transition(&current, event, ctx) {
            UpgradeTransitionResult::Success {
                to,
                event,
                description,
                ..
            } => (to, Some(event), description.to_string()),
            UpgradeTransitionResult::GuardFailed { reason, .. } => (current, None, reason),
            UpgradeTransitionResult::InvalidTransition { current, event } => (
                current,
                None,
                format!("No transition from {} on {}", current, event),
            ),
        },
        None => (current, None, waiting_message(&current, ctx)),
    };

    let action = required_action(&phase, ctx);
    let conditions = conditions_for(&phase, event.as_ref(), ctx);

    UpgradeDecision {
        phase,
        event,
        message,
        action,
        conditions,
    }
}

/// The single mutation needed to make progress in `phase`, if any
fn required_action(phase: &UpgradePhase, ctx: &UpgradeTransitionContext) -> Option<UpgradeAction> {
    match phase {
        UpgradePhase::ScalingDown
        | UpgradePhase::Upgrading
        | UpgradePhase::Validating
        | UpgradePhase::RemovingOldData
            if ctx.replicas.requested != 0 =>
        {
            Some(UpgradeAction::RequestReplicas(0))
        }

        UpgradePhase::Upgrading
            if ctx.upgrade_job == JobState::Missing && ctx.is_quiesced() =>
        {
            Some(UpgradeAction::CreateUpgradeJob)
        }

        UpgradePhase::RemovingOldData if ctx.is_quiesced() && ctx.failed_removal().is_none() => ctx
            .next_missing_removal()
            .map(|j| UpgradeAction::CreateRemoveDataJob {
                instance: j.instance.clone(),
            }),

        UpgradePhase::ScalingUp if ctx.replicas.requested != ctx.desired_replicas => {
            Some(UpgradeAction::RequestReplicas(ctx.desired_replicas))
        }

        _ => None,
    }
}

fn waiting_message(phase: &UpgradePhase, ctx: &UpgradeTransitionContext) -> String {
    match phase {
        UpgradePhase::ScalingDown => format!(
            "Waiting for cluster to stop: {} requested, {} ready",
            ctx.replicas.requested, ctx.replicas.ready
        ),
        UpgradePhase::Upgrading => format!("Waiting for upgrade job {}", ctx.upgrade_job_name),
        UpgradePhase::Validating => format!("Waiting for upgrade job {}", ctx.upgrade_job_name),
        UpgradePhase::RemovingOldData => match ctx.failed_removal() {
            Some(job) => UpgradeError::RemoveDataJobFailed {
                job: job.job.clone(),
            }
            .to_string(),
            None => "Waiting for removal jobs".to_string(),
        },
        UpgradePhase::ScalingUp => format!(
            "Waiting for cluster to start: {}/{} ready",
            ctx.replicas.ready, ctx.desired_replicas
        ),
        _ => format!("Upgrade {}", phase),
    }
}

fn conditions_for(
    phase: &UpgradePhase,
    event: Option<&UpgradeEvent>,
    ctx: &UpgradeTransitionContext,
) -> Vec<ConditionUpdate> {
    let mut conditions = vec![ConditionUpdate::new(
        condition_types::VALID_SPEC,
        true,
        "SpecValid",
        "Spec and cluster are valid".to_string(),
    )];

    conditions.push(ConditionUpdate::new(
        condition_types::PROGRESSING,
        !phase.is_terminal(),
        phase_reason(phase),
        format!("Upgrade is {}", phase),
    ));

    if matches!(
        phase,
        UpgradePhase::ScalingDown
            | UpgradePhase::Upgrading
            | UpgradePhase::Validating
            | UpgradePhase::RemovingOldData
    ) {
        let quiesced = ctx.is_quiesced();
        conditions.push(ConditionUpdate::new(
            condition_types::CLUSTER_QUIESCED,
            quiesced,
            if quiesced { "Quiesced" } else { "InstancesRunning" },
            format!(
                "{} requested, {} ready",
                ctx.replicas.requested, ctx.replicas.ready
            ),
        ));
    }

    match event {
        Some(UpgradeEvent::UpgradeJobFailed) => conditions.push(ConditionUpdate::new(
            condition_types::UPGRADE_JOB_FAILED,
            true,
            "JobFailed",
            UpgradeError::UpgradeJobFailed {
                job: ctx.upgrade_job_name.clone(),
            }
            .to_string(),
        )),
        Some(UpgradeEvent::PostCheckFailed) => conditions.push(ConditionUpdate::new(
            condition_types::UPGRADE_JOB_FAILED,
            true,
            "PostCheckFailed",
            UpgradeError::PostCheckFailed(match ctx.upgrade_job_version {
                Some(v) => format!(
                    "job {} targets version {}, expected {}",
                    ctx.upgrade_job_name, v, ctx.to_version
                ),
                None => format!("job {} not found", ctx.upgrade_job_name),
            })
            .to_string(),
        )),
        _ => {}
    }

    if *phase == UpgradePhase::RemovingOldData {
        match ctx.failed_removal() {
            Some(job) => conditions.push(ConditionUpdate::new(
                condition_types::REMOVE_DATA_FAILED,
                true,
                "JobFailed",
                UpgradeError::RemoveDataJobFailed {
                    job: job.job.clone(),
                }
                .to_string(),
            )),
            None => conditions.push(ConditionUpdate::new(
                condition_types::REMOVE_DATA_FAILED,
                false,
                "NoFailures",
                "No removal job has failed".to_string(),
            )),
        }
    }

    if *phase == UpgradePhase::Succeeded {
        conditions.push(ConditionUpdate::new(
            condition_types::SUCCEEDED,
            true,
            "UpgradeComplete",
            format!("Cluster upgraded to version {}", ctx.to_version),
        ));
    }

    conditions
}

fn phase_reason(phase: &UpgradePhase) -> &'static str {
    match phase {
        UpgradePhase::Pending => "Pending",
        UpgradePhase::ScalingDown => "ScalingDown",
        UpgradePhase::Upgrading => "Upgrading",
        UpgradePhase::Validating => "Validating",
        UpgradePhase::RemovingOldData => "RemovingOldData",
        UpgradePhase::ScalingUp => "ScalingUp",
        UpgradePhase::Succeeded => "Succeeded",
        UpgradePhase::Failed => "Failed",
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    fn ctx() -> UpgradeTransitionContext {
        UpgradeTransitionContext {
            replicas: ReplicaCounts {
                requested: 2,
                ready: 2,
            },
            desired_replicas: 2,
            upgrade_job_name: "pgu-pgdata".to_string(),
            to_version: 17,
            removal_jobs: vec![RemovalJob {
                instance: "pg-b".to_string(),
                job: "pgu-pg-b".to_string(),
                state: JobState::Missing,
            }],
            ..Default::default()
        }
    }

    fn quiesced() -> UpgradeTransitionContext {
        UpgradeTransitionContext {
            replicas: ReplicaCounts::default(),
            ..ctx()
        }
    }

    #[test]
    fn test_pending_to_scaling_down() {
        let sm = UpgradeStateMachine::new();
        let result = sm.transition(&UpgradePhase::Pending, UpgradeEvent::ValidationPassed, &ctx());

        match result {
            UpgradeTransitionResult::Success { from, to, .. } => {
                assert_eq!(from, UpgradePhase::Pending);
                assert_eq!(to, UpgradePhase::ScalingDown);
            }
            _ => panic!("Expected successful transition"),
        }
    }

    #[test]
    fn test_quiesced_guard() {
        let sm = UpgradeStateMachine::new();

        let result = sm.transition(
            &UpgradePhase::ScalingDown,
            UpgradeEvent::ClusterQuiesced,
            &ctx(),
        );
        assert!(matches!(
            result,
            UpgradeTransitionResult::GuardFailed { .. }
        ));

        let result = sm.transition(
            &UpgradePhase::ScalingDown,
            UpgradeEvent::ClusterQuiesced,
            &quiesced(),
        );
        assert!(matches!(result, UpgradeTransitionResult::Success { .. }));
    }

    #[test]
    fn test_removing_old_data_cannot_fail() {
        let sm = UpgradeStateMachine::new();
        assert!(!sm.can_transition(&UpgradePhase::RemovingOldData, &UpgradeEvent::UpgradeJobFailed));
        assert!(!sm.can_transition(&UpgradePhase::RemovingOldData, &UpgradeEvent::PostCheckFailed));
        assert_eq!(
            sm.valid_events(&UpgradePhase::RemovingOldData),
            vec![&UpgradeEvent::OldDataRemoved]
        );
    }

    #[test]
    fn test_terminal_phases_have_no_events() {
        let sm = UpgradeStateMachine::new();
        assert!(sm.valid_events(&UpgradePhase::Succeeded).is_empty());
        assert!(sm.valid_events(&UpgradePhase::Failed).is_empty());
    }

    #[test]
    fn test_decide_pending_requests_scale_down() {
        let sm = UpgradeStateMachine::new();
        let decision = decide(&sm, UpgradePhase::Pending, &ctx());

        assert_eq!(decision.phase, UpgradePhase::ScalingDown);
        assert_eq!(decision.event, Some(UpgradeEvent::ValidationPassed));
        assert_eq!(decision.action, Some(UpgradeAction::RequestReplicas(0)));
    }

    #[test]
    fn test_decide_validation_error_holds_pending() {
        let sm = UpgradeStateMachine::new();
        let ctx = UpgradeTransitionContext {
            validation_error: Some("image is required".to_string()),
            ..ctx()
        };
        let decision = decide(&sm, UpgradePhase::Pending, &ctx);

        assert_eq!(decision.phase, UpgradePhase::Pending);
        assert!(decision.action.is_none());
        assert!(decision.awaits_edit());
        assert_eq!(decision.conditions[0].reason, "InvalidSpec");
    }

    #[test]
    fn test_decide_scaling_down_waits_for_ready_pods() {
        let sm = UpgradeStateMachine::new();
        let ctx = UpgradeTransitionContext {
            replicas: ReplicaCounts {
                requested: 0,
                ready: 1,
            },
            ..ctx()
        };
        let decision = decide(&sm, UpgradePhase::ScalingDown, &ctx);

        assert_eq!(decision.phase, UpgradePhase::ScalingDown);
        assert!(decision.action.is_none());
    }

    #[test]
    fn test_decide_quiesced_creates_upgrade_job() {
        let sm = UpgradeStateMachine::new();
        let decision = decide(&sm, UpgradePhase::ScalingDown, &quiesced());

        assert_eq!(decision.phase, UpgradePhase::Upgrading);
        assert_eq!(decision.action, Some(UpgradeAction::CreateUpgradeJob));
    }

    #[test]
    fn test_decide_upgrading_reasserts_scale_down() {
        let sm = UpgradeStateMachine::new();
        let ctx = UpgradeTransitionContext {
            replicas: ReplicaCounts {
                requested: 1,
                ready: 0,
            },
            ..ctx()
        };
        let decision = decide(&sm, UpgradePhase::Upgrading, &ctx);

        assert_eq!(decision.phase, UpgradePhase::Upgrading);
        assert_eq!(decision.action, Some(UpgradeAction::RequestReplicas(0)));
    }

    #[test]
    fn test_decide_existing_job_is_not_recreated() {
        let sm = UpgradeStateMachine::new();
        let ctx = UpgradeTransitionContext {
            upgrade_job: JobState::Running,
            ..quiesced()
        };
        let decision = decide(&sm, UpgradePhase::Upgrading, &ctx);

        assert_eq!(decision.phase, UpgradePhase::Upgrading);
        assert!(decision.action.is_none());
    }

    #[test]
    fn test_decide_upgrade_job_failure_is_terminal() {
        let sm = UpgradeStateMachine::new();
        let ctx = UpgradeTransitionContext {
            upgrade_job: JobState::Failed,
            ..quiesced()
        };
        let decision = decide(&sm, UpgradePhase::Upgrading, &ctx);

        assert_eq!(decision.phase, UpgradePhase::Failed);
        assert!(decision.action.is_none());
        assert!(
            decision
                .conditions
                .iter()
                .any(|c| c.type_ == condition_types::UPGRADE_JOB_FAILED && c.status)
        );

        let again = decide(&sm, decision.phase, &ctx);
        assert_eq!(again.phase, UpgradePhase::Failed);
        assert!(again.action.is_none());
    }

    #[test]
    fn test_decide_post_check_version_mismatch_fails() {
        let sm = UpgradeStateMachine::new();
        let ctx = UpgradeTransitionContext {
            upgrade_job: JobState::Succeeded,
            upgrade_job_version: Some(16),
            ..quiesced()
        };
        let decision = decide(&sm, UpgradePhase::Validating, &ctx);

        assert_eq!(decision.phase, UpgradePhase::Failed);
        assert_eq!(decision.event, Some(UpgradeEvent::PostCheckFailed));
    }

    #[test]
    fn test_decide_post_check_passes_and_creates_removal_job() {
        let sm = UpgradeStateMachine::new();
        let ctx = UpgradeTransitionContext {
            upgrade_job: JobState::Succeeded,
            upgrade_job_version: Some(17),
            ..quiesced()
        };
        let decision = decide(&sm, UpgradePhase::Validating, &ctx);

        assert_eq!(decision.phase, UpgradePhase::RemovingOldData);
        assert_eq!(
            decision.action,
            Some(UpgradeAction::CreateRemoveDataJob {
                instance: "pg-b".to_string()
            })
        );
    }

    #[test]
    fn test_decide_removal_failure_stalls() {
        let sm = UpgradeStateMachine::new();
        let mut ctx = UpgradeTransitionContext {
            upgrade_job: JobState::Succeeded,
            upgrade_job_version: Some(17),
            ..quiesced()
        };
        ctx.removal_jobs[0].state = JobState::Failed;
        ctx.removal_jobs.push(RemovalJob {
            instance: "pg-c".to_string(),
            job: "pgu-pg-c".to_string(),
            state: JobState::Missing,
        });

        let decision = decide(&sm, UpgradePhase::RemovingOldData, &ctx);

        assert_eq!(decision.phase, UpgradePhase::RemovingOldData);
        assert!(decision.action.is_none());
        assert!(decision.message.contains("pgu-pg-b"));
        assert!(
            decision
                .conditions
                .iter()
                .any(|c| c.type_ == condition_types::REMOVE_DATA_FAILED && c.status)
        );
    }

    #[test]
    fn test_decide_single_instance_skips_removal() {
        let sm = UpgradeStateMachine::new();
        let ctx = UpgradeTransitionContext {
            removal_jobs: Vec::new(),
            desired_replicas: 1,
            ..quiesced()
        };
        let decision = decide(&sm, UpgradePhase::RemovingOldData, &ctx);

        assert_eq!(decision.phase, UpgradePhase::ScalingUp);
        assert_eq!(decision.action, Some(UpgradeAction::RequestReplicas(1)));
    }

    #[test]
    fn test_decide_scaling_up_to_succeeded() {
        let sm = UpgradeStateMachine::new();
        let decision = decide(&sm, UpgradePhase::ScalingUp, &ctx());

        assert_eq!(decision.phase, UpgradePhase::Succeeded);
        assert!(decision.action.is_none());
        assert!(
            decision
                .conditions
                .iter()
                .any(|c| c.type_ == condition_types::SUCCEEDED && c.status)
        );
    }

    #[test]
    fn test_decide_is_pure() {
        let sm = UpgradeStateMachine::new();
        for phase in [
            UpgradePhase::Pending,
            UpgradePhase::ScalingDown,
            UpgradePhase::Upgrading,
            UpgradePhase::Validating,
            UpgradePhase::RemovingOldData,
            UpgradePhase::ScalingUp,
        ] {
            assert_eq!(decide(&sm, phase, &ctx()), decide(&sm, phase, &ctx()));
        }
    }
}
