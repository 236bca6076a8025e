//! Error types for the PGUpgrade controller
//!
//! Errors are classified into three categories:
//! - **Permanent**: the PGUpgrade or the cluster it names is unusable as-is;
//!   nothing changes until the resource is edited
//! - **Transient**: API failures that are retried with backoff
//! - **Execution**: a generated job exited non-zero; recorded on status
//!   conditions by the state machine and never returned from a reconcile

use std::time::Duration;

use thiserror::Error;

/// Error variants for PGUpgrade reconciliation.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum UpgradeError {
    // ============================================
    // Permanent Errors (do not retry automatically)
    // ============================================
    /// Validation error - spec is invalid
    #[error("Validation failed: {0}")]
    ValidationError(String),

    /// Destination version is not newer than the source version
    #[error("Version downgrade not allowed: {from_version} -> {to_version}")]
    DowngradeNotAllowed { from_version: i32, to_version: i32 },

    /// No instance StatefulSets carry the cluster's labels
    #[error("Cluster not found: {namespace}/{name}")]
    ClusterNotFound { namespace: String, name: String },

    /// An instance has no database container to copy a job template from
    #[error("StatefulSet {statefulset} has no database container")]
    MissingReferenceTemplate { statefulset: String },

    /// The object is missing a field the controller relies on
    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    // ============================================
    // Transient Errors (retry with backoff)
    // ============================================
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    // ============================================
    // Execution Errors (reported, never retried)
    // ============================================
    /// The upgrade job exited non-zero
    #[error("Upgrade job {job} failed")]
    UpgradeJobFailed { job: String },

    /// The upgrade job finished but did not produce the destination version
    #[error("Post-upgrade check failed: {0}")]
    PostCheckFailed(String),

    /// A data removal job exited non-zero
    #[error("Data removal job {job} failed; old data left in place")]
    RemoveDataJobFailed { job: String },
}

impl UpgradeError {
    /// Returns true if this error should trigger an automatic retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpgradeError::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            _ => false,
        }
    }

    /// Returns true if this error is permanent and requires user intervention.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            UpgradeError::ValidationError(_)
                | UpgradeError::DowngradeNotAllowed { .. }
                | UpgradeError::ClusterNotFound { .. }
                | UpgradeError::MissingReferenceTemplate { .. }
                | UpgradeError::MissingObjectKey(_)
        )
    }

    /// Returns true if the API reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, UpgradeError::KubeError(kube::Error::Api(api_err)) if api_err.code == 404)
    }
}

/// Result type for upgrade operations
pub type UpgradeResult<T> = std::result::Result<T, UpgradeError>;

/// Backoff configuration for failed reconciliations
#[derive(Clone, Debug)]
pub struct UpgradeBackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for UpgradeBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl UpgradeBackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(32)).unwrap_or(32);
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        // Apply jitter
        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        // Cap at max delay
        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the appropriate delay for an error
    pub fn delay_for_error(&self, error: &UpgradeError, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Permanent and execution errors wait for an edit or a child status change
            self.max_delay
        }
    }
}
