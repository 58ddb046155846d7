//! Virtual key provisioning for vkgate.
//!
//! [`KeyPlanner`] creates missing rows; [`KeyProvisioner`] drives them to
//! ACTIVE through a [`vkgate_types::KeyService`], retries failures with
//! exponential backoff, and revokes keys on request.

pub mod backoff;
pub mod planner;
pub mod provisioner;
mod worker;

pub use planner::{EnsureOutcome, KeyPlanner};
pub use provisioner::{
    KeyProvisioner, ProvisionOutcome, ReconcileStats, RemoteDelete, RevokeOutcome,
};
