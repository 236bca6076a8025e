// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the PGUpgrade operator
//!
//! This module contains unit tests for:
//! - PGUpgrade manifests and the CRD definition
//! - Job generation against a reference StatefulSet
//! - Full upgrade lifecycles driven through an in-memory cluster
//! - Resource quantity normalization
//! - The failover HTTP boundary

#[path = "../common/mod.rs"]
mod common;

mod crd;
mod failover;
mod quantity;
