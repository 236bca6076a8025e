// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for PGUpgrade job generation and phase decisions
//!
//! These tests use proptest to generate random upgrades and observations and
//! verify that:
//! 1. Job commands always end with the expected positional arguments
//! 2. Job names depend only on the PGUpgrade and instance names
//! 3. Job generation is deterministic and never privileged
//! 4. Every decision takes at most one valid transition and one safe action
//! 5. Quantity normalization is idempotent

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;

use proptest::prelude::*;

use pg_upgrade_operator::controller::availability::plan_replicas;
use pg_upgrade_operator::controller::state_machine::{
    JobState, RemovalJob, ReplicaCounts, UpgradeAction, UpgradeStateMachine,
    UpgradeTransitionContext, decide,
};
use pg_upgrade_operator::controller::validation::validate_versions;
use pg_upgrade_operator::crd::UpgradePhase;
use pg_upgrade_operator::resources::jobs::{generate_remove_data_job, generate_upgrade_job};
use pg_upgrade_operator::resources::quantity::canonical_quantity;
use pg_upgrade_operator::resources::scripts::INTERPRETER;

use common::*;

// =============================================================================
// Strategy generators
// =============================================================================

/// Generate a DNS-label style resource name
fn resource_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}[a-z0-9]"
}

/// Generate an ascending major version pair
fn version_pair() -> impl Strategy<Value = (i32, i32)> {
    (1..=40i32).prop_flat_map(|from| (Just(from), (from + 1)..=(from + 10)))
}

fn upgrade_phase() -> impl Strategy<Value = UpgradePhase> {
    prop_oneof![
        Just(UpgradePhase::Pending),
        Just(UpgradePhase::ScalingDown),
        Just(UpgradePhase::Upgrading),
        Just(UpgradePhase::Validating),
        Just(UpgradePhase::RemovingOldData),
        Just(UpgradePhase::ScalingUp),
        Just(UpgradePhase::Succeeded),
        Just(UpgradePhase::Failed),
    ]
}

fn job_state() -> impl Strategy<Value = JobState> {
    prop_oneof![
        Just(JobState::Missing),
        Just(JobState::Running),
        Just(JobState::Succeeded),
        Just(JobState::Failed),
    ]
}

/// Generate an arbitrary observation of a cluster and its jobs
fn transition_context() -> impl Strategy<Value = UpgradeTransitionContext> {
    (
        prop::option::weighted(0.1, "[a-z ]{1,20}"),
        0..=4i32,
        0..=4i32,
        1..=4i32,
        job_state(),
        prop::option::of(15..=18i32),
        prop::collection::vec(job_state(), 0..=3),
    )
        .prop_map(
            |(validation_error, requested, ready, desired, upgrade_job, version, removals)| {
                UpgradeTransitionContext {
                    validation_error,
                    replicas: ReplicaCounts { requested, ready },
                    desired_replicas: desired,
                    upgrade_job_name: "pgu-pgdata".to_string(),
                    upgrade_job,
                    upgrade_job_version: version,
                    to_version: 17,
                    removal_jobs: removals
                        .into_iter()
                        .enumerate()
                        .map(|(i, state)| RemovalJob {
                            instance: format!("pg-{}", i),
                            job: format!("pgu-pg-{}", i),
                            state,
                        })
                        .collect(),
                }
            },
        )
}

/// Generate a parseable, non-negative quantity
fn quantity() -> impl Strategy<Value = String> {
    (
        0..=100_000u32,
        prop::option::of(1..=999u32),
        prop_oneof![
            Just(""),
            Just("m"),
            Just("k"),
            Just("M"),
            Just("G"),
            Just("Ki"),
            Just("Mi"),
            Just("Gi"),
        ],
    )
        .prop_map(|(whole, fraction, suffix)| match fraction {
            Some(f) => format!("{}.{}{}", whole, f, suffix),
            None => format!("{}{}", whole, suffix),
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // =========================================================================
    // Job generation properties
    // =========================================================================

    /// Property: Upgrade command ends with `upgrade <from> <to>`
    #[test]
    fn prop_upgrade_command_suffix((from, to) in version_pair()) {
        let upgrade = PGUpgradeBuilder::new("pgu", "db").versions(from, to).build();
        let job = generate_upgrade_job(&upgrade, &InstanceBuilder::new("pg-a", "pg").build());
        let cmd = job.spec.unwrap().template.spec.unwrap().containers[0]
            .command
            .clone()
            .unwrap();

        prop_assert_eq!(cmd.len(), 7);
        prop_assert_eq!(&cmd[..3], &INTERPRETER[..]);
        prop_assert_eq!(
            cmd[4..].to_vec(),
            vec!["upgrade".to_string(), from.to_string(), to.to_string()]
        );
    }

    /// Property: Removal command ends with `remove <from>`
    #[test]
    fn prop_remove_command_suffix((from, to) in version_pair()) {
        let upgrade = PGUpgradeBuilder::new("pgu", "db").versions(from, to).build();
        let job = generate_remove_data_job(&upgrade, &InstanceBuilder::new("pg-a", "pg").build());
        let cmd = job.spec.unwrap().template.spec.unwrap().containers[0]
            .command
            .clone()
            .unwrap();

        prop_assert_eq!(cmd.len(), 6);
        prop_assert_eq!(cmd[4..].to_vec(), vec!["remove".to_string(), from.to_string()]);
    }

    /// Property: Job names depend only on the PGUpgrade and instance names
    #[test]
    fn prop_job_names_are_pure(
        name in resource_name(),
        instance in resource_name(),
        (from, to) in version_pair(),
        image in "[a-z]{1,10}:[0-9]{1,3}",
    ) {
        let upgrade = PGUpgradeBuilder::new(&name, "db")
            .versions(from, to)
            .image(&image)
            .build();
        let sts = InstanceBuilder::new(&instance, "pg").build();

        let upgrade_job = generate_upgrade_job(&upgrade, &sts);
        let remove_job = generate_remove_data_job(&upgrade, &sts);

        prop_assert_eq!(upgrade_job.metadata.name, Some(format!("{}-pgdata", name)));
        prop_assert_eq!(remove_job.metadata.name, Some(format!("{}-{}", name, instance)));
    }

    /// Property: Generation is deterministic
    #[test]
    fn prop_generation_deterministic(
        name in resource_name(),
        (from, to) in version_pair(),
        cpu in quantity(),
    ) {
        let upgrade = PGUpgradeBuilder::new(&name, "db")
            .versions(from, to)
            .cpu_request(&cpu)
            .build();
        let sts = InstanceBuilder::new("pg-a", "pg").with_sidecar("exporter").build();

        prop_assert_eq!(
            generate_upgrade_job(&upgrade, &sts),
            generate_upgrade_job(&upgrade, &sts)
        );
        prop_assert_eq!(
            generate_remove_data_job(&upgrade, &sts),
            generate_remove_data_job(&upgrade, &sts)
        );
    }

    /// Property: Generated containers are never privileged
    #[test]
    fn prop_never_privileged(privileged in prop::option::of(any::<bool>())) {
        let mut sts = InstanceBuilder::new("pg-a", "pg").build();
        let pod = sts.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.containers[0].security_context.as_mut().unwrap().privileged = privileged;

        let upgrade = create_test_upgrade("pgu", "db", "pg", 15, 17);
        for job in [generate_upgrade_job(&upgrade, &sts), generate_remove_data_job(&upgrade, &sts)] {
            let containers = job.spec.unwrap().template.spec.unwrap().containers;
            prop_assert_eq!(containers.len(), 1);
            prop_assert_eq!(
                containers[0].security_context.as_ref().and_then(|c| c.privileged),
                Some(false)
            );
        }
    }

    // =========================================================================
    // Decision properties
    // =========================================================================

    /// Property: A decision takes at most one transition, and only a valid one
    #[test]
    fn prop_decision_takes_one_valid_step(
        phase in upgrade_phase(),
        ctx in transition_context(),
    ) {
        let sm = UpgradeStateMachine::new();
        let decision = decide(&sm, phase, &ctx);

        match &decision.event {
            Some(event) => {
                prop_assert!(sm.can_transition(&phase, event));
                prop_assert_ne!(decision.phase, phase);
            }
            None => prop_assert_eq!(decision.phase, phase),
        }

        if phase.is_terminal() || ctx.validation_error.is_some() {
            prop_assert_eq!(decision.phase, phase);
            prop_assert!(decision.action.is_none());
        }
    }

    /// Property: Actions never endanger data
    #[test]
    fn prop_actions_are_safe(phase in upgrade_phase(), ctx in transition_context()) {
        let decision = decide(&UpgradeStateMachine::new(), phase, &ctx);

        match decision.action {
            Some(UpgradeAction::CreateUpgradeJob) => {
                prop_assert_eq!(decision.phase, UpgradePhase::Upgrading);
                prop_assert!(ctx.is_quiesced());
            }
            Some(UpgradeAction::CreateRemoveDataJob { .. }) => {
                prop_assert_eq!(decision.phase, UpgradePhase::RemovingOldData);
                prop_assert!(ctx.is_quiesced());
                prop_assert!(ctx.failed_removal().is_none());
                prop_assert!(
                    phase == UpgradePhase::RemovingOldData || ctx.post_check_passed()
                );
            }
            Some(UpgradeAction::RequestReplicas(n)) if n > 0 => {
                prop_assert_eq!(decision.phase, UpgradePhase::ScalingUp);
                prop_assert_eq!(n, ctx.desired_replicas);
            }
            Some(UpgradeAction::RequestReplicas(_)) => {
                prop_assert!(ctx.replicas.requested != 0);
            }
            None => {}
        }
    }

    /// Property: Once a decision's phase is recorded, the same observation
    /// moves it no further unless another step is due
    #[test]
    fn prop_decision_reaches_fixed_point(
        phase in upgrade_phase(),
        ctx in transition_context(),
    ) {
        let sm = UpgradeStateMachine::new();
        let mut current = phase;
        for _ in 0..8 {
            let decision = decide(&sm, current, &ctx);
            if decision.phase == current {
                prop_assert_eq!(decide(&sm, current, &ctx), decision);
                return Ok(());
            }
            prop_assert!(decision.phase.ordinal() > current.ordinal()
                || decision.phase == UpgradePhase::Failed);
            current = decision.phase;
        }
        prop_assert!(false, "no fixed point reached from {}", phase);
    }

    // =========================================================================
    // Supporting properties
    // =========================================================================

    /// Property: Only ascending positive version pairs are accepted
    #[test]
    fn prop_version_validation(from in -5..=40i32, to in -5..=40i32) {
        let result = validate_versions(from, to);
        if from > 0 && to > from {
            prop_assert!(result.is_ok(), "{} -> {} should be allowed", from, to);
        } else {
            prop_assert!(result.is_err(), "{} -> {} should be rejected", from, to);
        }
    }

    /// Property: Canonical quantities are already canonical
    #[test]
    fn prop_quantity_idempotent(value in quantity()) {
        let once = canonical_quantity(&value).unwrap();
        let twice = canonical_quantity(&once.0).unwrap();
        prop_assert_eq!(once, twice);
    }

    /// Property: Replica plans run exactly the requested instances,
    /// startup instance first
    #[test]
    fn prop_replica_plan(
        current in prop::collection::btree_map("pg-[a-z]{1,4}", 0..=1i32, 1..=6),
        replicas in 0..=8i32,
        startup_index in any::<prop::sample::Index>(),
    ) {
        let names: Vec<String> = current.keys().cloned().collect();
        let startup = startup_index.get(&names).clone();

        let mut applied: BTreeMap<String, i32> = current.clone();
        for (name, value) in plan_replicas(&current, Some(&startup), replicas) {
            prop_assert_ne!(current.get(&name), Some(&value));
            applied.insert(name, value);
        }

        let running: i32 = applied.values().sum();
        prop_assert_eq!(running, replicas.min(i32::try_from(names.len()).unwrap()));
        if replicas > 0 {
            prop_assert_eq!(applied.get(&startup), Some(&1));
        }
    }
}
