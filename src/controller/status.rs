//! Status and conditions management for PGUpgrade resources
//!
//! This module provides utilities for managing Kubernetes-style conditions
//! and updating the status subresource.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};

use crate::controller::error::UpgradeResult;
use crate::controller::state_machine::{ConditionUpdate, UpgradeDecision};
use crate::crd::{Condition, PGUpgrade, PGUpgradeStatus, UpgradePhase};

/// Condition types recorded on a PGUpgrade
pub mod condition_types {
    /// Spec and the cluster it names are usable
    pub const VALID_SPEC: &str = "ValidSpec";
    /// Upgrade is moving towards a terminal phase
    pub const PROGRESSING: &str = "Progressing";
    /// No instance of the cluster is requested or running
    pub const CLUSTER_QUIESCED: &str = "ClusterQuiesced";
    /// The upgrade job failed or produced the wrong version
    pub const UPGRADE_JOB_FAILED: &str = "UpgradeJobFailed";
    /// A data removal job failed
    pub const REMOVE_DATA_FAILED: &str = "RemoveDataFailed";
    /// Upgrade completed
    pub const SUCCEEDED: &str = "Succeeded";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            // Transition time only moves when the status flips
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Apply a condition computed by the state machine
    pub fn apply(self, update: &ConditionUpdate) -> Self {
        let status = if update.status {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(update.type_, status, update.reason, &update.message)
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Values observed during a reconcile that are pinned on status
#[derive(Debug, Clone, Default)]
pub struct PinnedObservation {
    pub startup_instance: Option<String>,
    pub desired_replicas: Option<i32>,
}

/// Compute the status that records `decision`.
///
/// The startup instance and desired replica count are written once and kept
/// for the rest of the upgrade.
pub fn next_status(
    upgrade: &PGUpgrade,
    decision: &UpgradeDecision,
    pinned: &PinnedObservation,
) -> PGUpgradeStatus {
    let generation = upgrade.metadata.generation;
    let existing = upgrade.status.clone().unwrap_or_default();
    let now = Utc::now().to_rfc3339();

    let conditions = decision
        .conditions
        .iter()
        .fold(
            ConditionBuilder::from_existing(existing.conditions.clone(), generation),
            |builder, update| builder.apply(update),
        )
        .build();

    let phase_changed = existing.phase != decision.phase || existing.phase_started_at.is_none();
    let left_pending = decision.phase != UpgradePhase::Pending;

    PGUpgradeStatus {
        phase: decision.phase,
        conditions,
        observed_generation: generation,
        message: Some(decision.message.clone()),
        startup_instance: existing
            .startup_instance
            .clone()
            .or_else(|| left_pending.then(|| pinned.startup_instance.clone()).flatten()),
        desired_replicas: existing
            .desired_replicas
            .or_else(|| left_pending.then_some(pinned.desired_replicas).flatten()),
        phase_started_at: if phase_changed {
            Some(now.clone())
        } else {
            existing.phase_started_at.clone()
        },
        started_at: existing
            .started_at
            .clone()
            .or_else(|| left_pending.then(|| now.clone())),
        completed_at: existing
            .completed_at
            .clone()
            .or_else(|| decision.phase.is_terminal().then(|| now.clone())),
        retry_count: Some(0),
        last_error: None,
    }
}

/// Merge patch body that replaces the recorded status
pub fn status_patch(status: &PGUpgradeStatus) -> serde_json::Value {
    serde_json::json!({ "status": status })
}

/// Status manager for PGUpgrade resources
pub struct StatusManager<'a> {
    upgrade: &'a PGUpgrade,
    client: &'a Client,
    ns: &'a str,
}

impl<'a> StatusManager<'a> {
    /// Create a new status manager
    pub fn new(upgrade: &'a PGUpgrade, client: &'a Client, ns: &'a str) -> Self {
        Self {
            upgrade,
            client,
            ns,
        }
    }

    /// Replace the upgrade status with a full status object
    pub async fn update(&self, status: &PGUpgradeStatus) -> UpgradeResult<()> {
        let api: Api<PGUpgrade> = Api::namespaced(self.client.clone(), self.ns);
        let patch = status_patch(status);

        api.patch_status(
            &self.upgrade.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }

    /// Record a reconcile error without changing the phase
    pub async fn record_error(&self, message: &str) -> UpgradeResult<()> {
        let api: Api<PGUpgrade> = Api::namespaced(self.client.clone(), self.ns);
        let retry_count = self
            .upgrade
            .status
            .as_ref()
            .and_then(|s| s.retry_count)
            .unwrap_or(0);

        let patch = serde_json::json!({
            "status": {
                "retryCount": retry_count.saturating_add(1),
                "lastError": message,
            }
        });

        api.patch_status(
            &self.upgrade.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }
}
