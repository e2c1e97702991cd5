//! Leaseman: a namespaced distributed lease manager.
//!
//! A `LeaseManager` grants exclusive, time-bounded ownership of named
//! resources ("leases") to holders, coordinating every local caller through
//! a single task against a shared, strongly consistent `LeaseStore`. Other
//! subsystems build on it through namespace-bound handles: `Claimer`,
//! `Checker` (and its cheap `Token`s), `Revoker`, `Pinner`, and `Reader`.

#[macro_use]
mod utils;

mod lease;
mod manager;

pub use utils::{logger_init, LeaseError, Timer, ME};

pub use lease::{
    standard_secretaries, ClaimOutcome, Clock, FileStore, GenericSecretary,
    LeadershipSecretary, LeaseKey, LeaseRecord, LeaseStore, ManualClock,
    MemStore, Secretary, SingularSecretary, Trapdoor, WallClock,
    LEADERSHIP_NAMESPACE, MAX_LEASE_DURATION, SINGULAR_NAMESPACE,
};

pub use manager::{
    Checker, Claimer, LeaseManager, ManagerConfig, ManagerHealth, Pinner,
    Reader, Revoker, Token,
};
