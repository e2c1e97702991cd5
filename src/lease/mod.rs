//! Lease data model, time source, name validation, and backing stores.

mod clock;
mod filestore;
mod secretary;
mod store;

use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

pub use clock::{Clock, ManualClock, WallClock};
pub use filestore::FileStore;
pub use secretary::{
    standard_secretaries, GenericSecretary, LeadershipSecretary, Secretary,
    SingularSecretary, LEADERSHIP_NAMESPACE, MAX_LEASE_DURATION,
    SINGULAR_NAMESPACE,
};
pub use store::{ClaimOutcome, LeaseStore, MemStore};

/// Identity of a lease. Identical names in different namespaces never
/// collide.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Clone,
    Serialize,
    Deserialize,
)]
pub struct LeaseKey {
    pub namespace: String,
    pub name: String,
}

impl LeaseKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        LeaseKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// SAFETY: `Hash` and `Eq` are derived over two `String`s, so they are
// deterministic and consistent with each other as flashmap requires.
unsafe impl flashmap::TrustedHashEq for LeaseKey {}

/// Durable state of one held lease.
///
/// Expiry is always derived from `start + duration` and never stored on its
/// own.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Current owner; never empty.
    pub holder: String,

    /// Time of the most recent successful claim or extension.
    pub start: SystemTime,

    /// Validity period requested by that claim or extension.
    pub duration: Duration,

    /// Entities currently pinning the lease. Non-empty means exempt from
    /// expiry.
    pub pinned_by: BTreeSet<String>,
}

impl LeaseRecord {
    pub fn new(
        holder: impl Into<String>,
        start: SystemTime,
        duration: Duration,
    ) -> Self {
        LeaseRecord {
            holder: holder.into(),
            start,
            duration,
            pinned_by: BTreeSet::new(),
        }
    }

    /// Expiry time. A record whose expiry is not representable counts as
    /// expired at its start, so that the sweep clears it.
    pub fn expiry(&self) -> SystemTime {
        self.start.checked_add(self.duration).unwrap_or(self.start)
    }

    pub fn is_pinned(&self) -> bool {
        !self.pinned_by.is_empty()
    }

    /// True if the expiry sweep would reap this record at time `now`.
    pub fn is_reapable(&self, now: SystemTime) -> bool {
        !self.is_pinned() && self.expiry() <= now
    }
}

/// Assertion produced by a passing token check, meant to be embedded as a
/// precondition in an unrelated store transaction: the transaction must
/// only commit if `holder` still holds `key` in the store at commit time.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Trapdoor {
    pub key: LeaseKey,
    pub holder: String,
}
