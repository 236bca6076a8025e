//! HTTP API served alongside the operator

pub mod failover;

pub use failover::{
    Authenticator, CreateFailoverRequest, CreateFailoverResponse, FailoverService, FailoverState,
    QueryFailoverResponse,
};
