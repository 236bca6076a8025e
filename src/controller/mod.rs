pub mod availability;
pub mod error;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod validation;

pub use availability::{ClusterAvailability, ClusterTarget, StatefulSetAvailability};
pub use error::{UpgradeBackoffConfig, UpgradeError, UpgradeResult};
pub use reconciler::{UpgradeContext, reconcile_upgrade, upgrade_error_policy};
pub use state_machine::{
    JobState, ReplicaCounts, UpgradeAction, UpgradeDecision, UpgradeEvent, UpgradeStateMachine,
    UpgradeTransitionContext, decide,
};
pub use status::{ConditionBuilder, StatusManager};
pub use validation::validate_upgrade;
