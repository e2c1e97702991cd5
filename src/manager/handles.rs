//! Namespace-bound handles through which subsystems use the manager.
//!
//! Every handle validates its arguments with the namespace's secretary on
//! the caller's own task first; malformed input fails fast without touching
//! the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use crate::lease::{Clock, LeaseKey, LeaseRecord, Secretary, Trapdoor};
use crate::manager::cache::CacheView;
use crate::manager::coordinator::{Reply, Request};
use crate::utils::LeaseError;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

/// Enqueues a request built around a fresh reply channel and waits for the
/// coordinator's answer.
pub(crate) async fn do_request<T>(
    tx_req: &mpsc::Sender<Request>,
    make_req: impl FnOnce(Reply<T>) -> Request,
) -> Result<T, LeaseError> {
    let (tx_reply, rx_reply) = oneshot::channel();
    tx_req.send(make_req(tx_reply)).await?;
    rx_reply.await?
}

/// Claims and extends leases of one namespace.
#[derive(Debug, Clone)]
pub struct Claimer {
    namespace: String,
    secretary: Arc<dyn Secretary>,
    tx_req: mpsc::Sender<Request>,
}

impl Claimer {
    pub(crate) fn new(
        namespace: String,
        secretary: Arc<dyn Secretary>,
        tx_req: mpsc::Sender<Request>,
    ) -> Self {
        Claimer {
            namespace,
            secretary,
            tx_req,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Claims lease `name` for `holder` for `duration`, or extends it if
    /// `holder` already holds it. Fails with `LeaseHeld` if anyone else
    /// holds it; never blocks waiting for the lease.
    pub async fn claim(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<(), LeaseError> {
        self.secretary.check_lease(name)?;
        self.secretary.check_holder(holder)?;
        self.secretary.check_duration(duration)?;

        let key = LeaseKey::new(self.namespace.as_str(), name);
        do_request(&self.tx_req, |tx_reply| Request::Claim {
            key,
            holder: holder.into(),
            duration,
            tx_reply,
        })
        .await
    }
}

/// Produces tokens answering "does this holder still hold that lease" from
/// the cache alone.
#[derive(Debug, Clone)]
pub struct Checker {
    namespace: String,
    secretary: Arc<dyn Secretary>,
    view: CacheView,
    clock: Arc<dyn Clock>,
}

impl Checker {
    pub(crate) fn new(
        namespace: String,
        secretary: Arc<dyn Secretary>,
        view: CacheView,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Checker {
            namespace,
            secretary,
            view,
            clock,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns a token for `holder` on lease `name`. Invalid names do not
    /// fail here; the token's checks fail with the validation error instead.
    pub fn token(&self, name: &str, holder: &str) -> Token {
        let invalid = self
            .secretary
            .check_lease(name)
            .and_then(|_| self.secretary.check_holder(holder))
            .err();
        Token {
            key: LeaseKey::new(self.namespace.as_str(), name),
            holder: holder.into(),
            invalid,
            version: self.view.version(),
            view: self.view.clone(),
            clock: self.clock.clone(),
        }
    }
}

/// Cheap, cache-backed capsule validating that a holder still holds a lease.
///
/// A token is meant to be handed to an unrelated transaction and checked
/// right before it commits. The check reads the latest cache and is
/// best-effort, not linearizable: the cache may lag the store by up to the
/// manager's refresh interval for changes made by other managers. Callers
/// that need certainty must also assert the returned `Trapdoor` inside their
/// own store transaction.
#[derive(Debug, Clone)]
pub struct Token {
    key: LeaseKey,
    holder: String,
    invalid: Option<LeaseError>,
    version: u64,
    view: CacheView,
    clock: Arc<dyn Clock>,
}

impl Token {
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Cache version observed when the token was created.
    pub fn cache_version(&self) -> u64 {
        self.version
    }

    /// `Ok` if the holder holds the lease and it is pinned or unexpired;
    /// `NotHeld` or `LeaseExpired` otherwise. Never blocks.
    pub fn check(&self) -> Result<(), LeaseError> {
        if let Some(ref e) = self.invalid {
            return Err(e.clone());
        }
        self.view.check(&self.key, &self.holder, self.clock.now())
    }

    /// Like `check()`, but on success returns the assertion to embed in a
    /// store transaction.
    pub fn trapdoor(&self) -> Result<Trapdoor, LeaseError> {
        self.check()?;
        Ok(Trapdoor {
            key: self.key.clone(),
            holder: self.holder.clone(),
        })
    }
}

/// Voluntarily gives up leases of one namespace.
#[derive(Debug, Clone)]
pub struct Revoker {
    namespace: String,
    secretary: Arc<dyn Secretary>,
    tx_req: mpsc::Sender<Request>,
}

impl Revoker {
    pub(crate) fn new(
        namespace: String,
        secretary: Arc<dyn Secretary>,
        tx_req: mpsc::Sender<Request>,
    ) -> Self {
        Revoker {
            namespace,
            secretary,
            tx_req,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Removes lease `name` if `holder` holds it; `NotHeld` otherwise. Wakes
    /// everyone waiting for the lease to become free.
    pub async fn revoke(&self, name: &str, holder: &str) -> Result<(), LeaseError> {
        self.secretary.check_lease(name)?;
        self.secretary.check_holder(holder)?;

        let key = LeaseKey::new(self.namespace.as_str(), name);
        do_request(&self.tx_req, |tx_reply| Request::Revoke {
            key,
            holder: holder.into(),
            tx_reply,
        })
        .await
    }
}

/// Suspends and resumes expiry of leases of one namespace on behalf of named
/// entities. Pins are idempotent per entity; the lease stays exempt from
/// expiry while any entity pins it.
#[derive(Debug, Clone)]
pub struct Pinner {
    namespace: String,
    secretary: Arc<dyn Secretary>,
    tx_req: mpsc::Sender<Request>,
}

impl Pinner {
    pub(crate) fn new(
        namespace: String,
        secretary: Arc<dyn Secretary>,
        tx_req: mpsc::Sender<Request>,
    ) -> Self {
        Pinner {
            namespace,
            secretary,
            tx_req,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Pins lease `name` for `entity`. `NotHeld` if the lease is absent.
    pub async fn pin(&self, name: &str, entity: &str) -> Result<(), LeaseError> {
        self.secretary.check_lease(name)?;
        self.secretary.check_entity(entity)?;

        let key = LeaseKey::new(self.namespace.as_str(), name);
        do_request(&self.tx_req, |tx_reply| Request::Pin {
            key,
            entity: entity.into(),
            tx_reply,
        })
        .await
    }

    /// Withdraws `entity`'s pin of lease `name`. A no-op if the entity does
    /// not pin it or the lease is absent.
    pub async fn unpin(&self, name: &str, entity: &str) -> Result<(), LeaseError> {
        self.secretary.check_lease(name)?;
        self.secretary.check_entity(entity)?;

        let key = LeaseKey::new(self.namespace.as_str(), name);
        do_request(&self.tx_req, |tx_reply| Request::Unpin {
            key,
            entity: entity.into(),
            tx_reply,
        })
        .await
    }
}

/// Lists the leases of one namespace as currently cached.
#[derive(Debug, Clone)]
pub struct Reader {
    namespace: String,
    tx_req: mpsc::Sender<Request>,
}

impl Reader {
    pub(crate) fn new(namespace: String, tx_req: mpsc::Sender<Request>) -> Self {
        Reader { namespace, tx_req }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Leases of the namespace keyed by name. Served by the coordinator in
    /// queue order, so the answer reflects every request enqueued earlier.
    pub async fn leases(&self) -> Result<HashMap<String, LeaseRecord>, LeaseError> {
        let namespace = self.namespace.clone();
        do_request(&self.tx_req, |tx_reply| Request::Leases {
            namespace,
            tx_reply,
        })
        .await
    }
}
