//! The coordinator: the single task that serializes every lease operation of
//! one manager instance, owns the cache, and drives expiry sweeps, cache
//! refreshes, and waiter wake-ups.

use std::collections::HashMap;
use std::sync::Arc;

use crate::lease::{ClaimOutcome, Clock, LeaseKey, LeaseRecord, LeaseStore};
use crate::manager::cache::LeaseCache;
use crate::manager::waiters::{WaitSignal, WaiterRegistry};
use crate::manager::{ManagerConfig, ManagerHealth};
use crate::utils::{LeaseError, Timer};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;

use tokio_util::sync::CancellationToken;

/// Reply channel of a request.
pub(crate) type Reply<T> = oneshot::Sender<Result<T, LeaseError>>;

/// Requests enqueued by handles to the coordinator.
#[derive(Debug)]
pub(crate) enum Request {
    /// Claim a lease, or extend it if already held by `holder`.
    Claim {
        key: LeaseKey,
        holder: String,
        duration: Duration,
        tx_reply: Reply<()>,
    },

    /// Give up a lease held by `holder`.
    Revoke {
        key: LeaseKey,
        holder: String,
        tx_reply: Reply<()>,
    },

    /// Suspend expiry of a lease on behalf of `entity`.
    Pin {
        key: LeaseKey,
        entity: String,
        tx_reply: Reply<()>,
    },

    /// Withdraw `entity`'s pin of a lease.
    Unpin {
        key: LeaseKey,
        entity: String,
        tx_reply: Reply<()>,
    },

    /// Signal `tx_done` once the lease is absent; `tx_started` (if any) is
    /// signalled as soon as the waiter is registered.
    Wait {
        key: LeaseKey,
        tx_done: WaitSignal,
        tx_started: Option<oneshot::Sender<()>>,
    },

    /// Snapshot of one namespace's leases, keyed by name.
    Leases {
        namespace: String,
        tx_reply: Reply<HashMap<String, LeaseRecord>>,
    },
}

impl Request {
    /// Answers the request with an error without processing it.
    fn reject(self, err: LeaseError) {
        // the caller may be gone already; nothing to do then
        match self {
            Request::Claim { tx_reply, .. }
            | Request::Revoke { tx_reply, .. }
            | Request::Pin { tx_reply, .. }
            | Request::Unpin { tx_reply, .. } => {
                let _ = tx_reply.send(Err(err));
            }
            Request::Wait { tx_done, .. } => {
                let _ = tx_done.send(Err(err));
            }
            Request::Leases { tx_reply, .. } => {
                let _ = tx_reply.send(Err(err));
            }
        }
    }
}

/// Coordinator task state. Everything in here is touched only by the task
/// itself.
pub(crate) struct CoordinatorTask {
    config: ManagerConfig,

    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,

    /// Receiver side of the request queue.
    rx_req: mpsc::Receiver<Request>,

    /// Cancelled by the manager to request shutdown.
    shutdown: CancellationToken,

    cache: LeaseCache,
    waiters: WaiterRegistry,

    sweep_timer: Timer,
    refresh_timer: Timer,

    health: ManagerHealth,
    tx_health: watch::Sender<ManagerHealth>,
}

impl CoordinatorTask {
    /// Creates the coordinator task state with both timers armed.
    pub(crate) fn new(
        config: ManagerConfig,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        rx_req: mpsc::Receiver<Request>,
        shutdown: CancellationToken,
        cache: LeaseCache,
        tx_health: watch::Sender<ManagerHealth>,
    ) -> Result<Self, LeaseError> {
        let mut sweep_timer = Timer::new(clock.clone());
        sweep_timer.restart(config.sweep_interval())?;
        let mut refresh_timer = Timer::new(clock.clone());
        refresh_timer.restart(config.refresh_interval())?;

        Ok(CoordinatorTask {
            config,
            store,
            clock,
            rx_req,
            shutdown,
            cache,
            waiters: WaiterRegistry::new(),
            sweep_timer,
            refresh_timer,
            health: ManagerHealth::default(),
            tx_health,
        })
    }

    /// Handler of Claim request.
    async fn handle_claim(
        &mut self,
        key: &LeaseKey,
        holder: &str,
        duration: Duration,
    ) -> Result<(), LeaseError> {
        let now = self.clock.now();

        // a live lease of someone else in the cache is enough to deny
        // without a store round-trip; a stale one is re-checked at the store
        if let Some(record) = self.cache.get(key) {
            if record.holder != holder && !record.is_reapable(now) {
                pf_trace!(
                    "claim {} by {} denied by cache, held by {}",
                    key,
                    holder,
                    record.holder
                );
                return Err(LeaseError::LeaseHeld);
            }
        }

        match self
            .store
            .claim_or_extend(key, holder, now, duration)
            .await?
        {
            ClaimOutcome::Granted(record) => {
                if record.holder != holder {
                    return Err(LeaseError::Invariant(format!(
                        "claim {} by {} granted to {}",
                        key, holder, record.holder
                    )));
                }
                pf_trace!("claim {} by {} granted", key, holder);
                self.cache.upsert(key.clone(), record);
                Ok(())
            }
            ClaimOutcome::Denied(record) => {
                if record.holder == holder {
                    return Err(LeaseError::Invariant(format!(
                        "claim {} by {} denied to its own holder",
                        key, holder
                    )));
                }
                // another manager got there first; learn about it
                pf_trace!(
                    "claim {} by {} denied by store, held by {}",
                    key,
                    holder,
                    record.holder
                );
                self.cache.upsert(key.clone(), record);
                Err(LeaseError::LeaseHeld)
            }
        }
    }

    /// Handler of Revoke request.
    async fn handle_revoke(
        &mut self,
        key: &LeaseKey,
        holder: &str,
    ) -> Result<(), LeaseError> {
        match self.store.revoke(key, holder).await {
            Ok(()) => {
                pf_debug!("revoked {} held by {}", key, holder);
                self.cache.remove(key);
                self.waiters.wake(key);
                Ok(())
            }
            Err(LeaseError::NotHeld) => {
                // gone from the store already while the cache still shows
                // the caller as holder
                if self
                    .cache
                    .get(key)
                    .map_or(false, |record| record.holder == holder)
                {
                    self.forget(key);
                }
                Err(LeaseError::NotHeld)
            }
            Err(e) => Err(e),
        }
    }

    /// Handler of Pin request.
    async fn handle_pin(
        &mut self,
        key: &LeaseKey,
        entity: &str,
    ) -> Result<(), LeaseError> {
        match self.store.pin(key, entity).await {
            Ok(record) => {
                pf_debug!("pinned {} for {}", key, entity);
                self.cache.upsert(key.clone(), record);
                Ok(())
            }
            Err(LeaseError::NotHeld) => {
                // the store says the lease is gone; so must the cache
                self.forget(key);
                Err(LeaseError::NotHeld)
            }
            Err(e) => Err(e),
        }
    }

    /// Handler of Unpin request.
    async fn handle_unpin(
        &mut self,
        key: &LeaseKey,
        entity: &str,
    ) -> Result<(), LeaseError> {
        match self.store.unpin(key, entity).await? {
            Some(record) => {
                pf_debug!("unpinned {} for {}", key, entity);
                self.cache.upsert(key.clone(), record);
            }
            None => self.forget(key),
        }
        Ok(())
    }

    /// Handler of Wait request.
    fn handle_wait(
        &mut self,
        key: LeaseKey,
        tx_done: WaitSignal,
        tx_started: Option<oneshot::Sender<()>>,
    ) {
        // registration happens before `started` fires, so a caller that saw
        // `started` cannot miss the wake-up
        if self.cache.get(&key).is_some() {
            pf_trace!("waiter registered on {}", key);
            self.waiters.register(key, tx_done);
            if let Some(tx_started) = tx_started {
                let _ = tx_started.send(());
            }
        } else {
            if let Some(tx_started) = tx_started {
                let _ = tx_started.send(());
            }
            let _ = tx_done.send(Ok(()));
        }
    }

    /// Drops a lease the store no longer has and wakes its waiters.
    fn forget(&mut self, key: &LeaseKey) {
        if self.cache.remove(key) {
            pf_debug!("dropped stale cache entry {}", key);
        }
        self.waiters.wake(key);
    }

    /// Processes one request. Only a violated invariant is returned as
    /// error; everything else goes back to the caller.
    async fn handle_request(
        &mut self,
        req: Request,
    ) -> Result<(), LeaseError> {
        let result = match req {
            Request::Claim {
                key,
                holder,
                duration,
                tx_reply,
            } => {
                let result = self.handle_claim(&key, &holder, duration).await;
                let _ = tx_reply.send(result.clone());
                result
            }
            Request::Revoke {
                key,
                holder,
                tx_reply,
            } => {
                let result = self.handle_revoke(&key, &holder).await;
                let _ = tx_reply.send(result.clone());
                result
            }
            Request::Pin {
                key,
                entity,
                tx_reply,
            } => {
                let result = self.handle_pin(&key, &entity).await;
                let _ = tx_reply.send(result.clone());
                result
            }
            Request::Unpin {
                key,
                entity,
                tx_reply,
            } => {
                let result = self.handle_unpin(&key, &entity).await;
                let _ = tx_reply.send(result.clone());
                result
            }
            Request::Wait {
                key,
                tx_done,
                tx_started,
            } => {
                self.handle_wait(key, tx_done, tx_started);
                Ok(())
            }
            Request::Leases {
                namespace,
                tx_reply,
            } => {
                let leases = self.cache.namespace_snapshot(&namespace);
                let _ = tx_reply.send(Ok(leases));
                Ok(())
            }
        };

        match result {
            Err(LeaseError::Invariant(reason)) => {
                Err(LeaseError::Invariant(reason))
            }
            _ => Ok(()),
        }
    }

    /// Publishes the current health to the supervisor.
    fn publish_health(&self) {
        self.tx_health.send_replace(self.health.clone());
    }

    /// Expiry sweep tick: asks the store to reap everything due, then
    /// reconciles the cache and wakes waiters. Store failures are counted
    /// and retried on the next tick, never fatal.
    async fn handle_sweep_tick(&mut self) {
        let now = self.clock.now();
        match self.store.expire_due(now).await {
            Ok(expired) => {
                if self.health.consecutive_sweep_failures > 0 {
                    pf_info!(
                        "expiry sweep recovered after {} failures",
                        self.health.consecutive_sweep_failures
                    );
                    self.health = ManagerHealth::default();
                    self.publish_health();
                }
                if !expired.is_empty() {
                    pf_debug!("expiry sweep reaped {:?}", expired);
                    self.cache.remove_many(&expired);
                    for key in &expired {
                        self.waiters.wake(key);
                    }
                }
            }
            Err(e) => {
                self.health.consecutive_sweep_failures += 1;
                self.health.last_sweep_error = Some(e.to_string());
                let failures = self.health.consecutive_sweep_failures;
                if failures >= self.config.sweep_failure_alarm {
                    if !self.health.degraded {
                        pf_error!(
                            "expiry sweep failed {} times in a row: {}",
                            failures,
                            e
                        );
                    }
                    self.health.degraded = true;
                } else {
                    pf_warn!("expiry sweep failed ({}): {}", failures, e);
                }
                self.publish_health();
            }
        }

        let pruned = self.waiters.prune();
        if pruned > 0 {
            pf_trace!("pruned {} detached waiters", pruned);
        }
    }

    /// Periodic full refresh of the cache from the store.
    async fn handle_refresh(&mut self) {
        match self.store.read_all().await {
            Ok(snapshot) => {
                let vanished = self.cache.replace_all(snapshot);
                for key in &vanished {
                    self.waiters.wake(key);
                }
                pf_trace!(
                    "cache refreshed: {} leases, {} vanished, version {}",
                    self.cache.len(),
                    vanished.len(),
                    self.cache.version()
                );
            }
            Err(e) => pf_warn!("cache refresh failed: {}", e),
        }
    }

    /// Main loop. Due timer events go before queued requests. Every store
    /// round-trip races against shutdown, so a stuck store cannot hold the
    /// coordinator up; an abandoned request's caller sees `Stopped` through
    /// its dropped reply channel.
    async fn event_loop(&mut self) -> Result<(), LeaseError> {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;

                // shutdown requested by the supervisor
                _ = shutdown.cancelled() => {
                    pf_debug!("lease coordinator caught shutdown");
                    return Ok(());
                },

                // expiry sweep tick
                _ = self.sweep_timer.timeout() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            pf_debug!("shutdown during expiry sweep");
                            return Ok(());
                        },
                        _ = self.handle_sweep_tick() => {},
                    }
                    self.sweep_timer.restart(self.config.sweep_interval())?;
                },

                // full cache refresh
                _ = self.refresh_timer.timeout() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            pf_debug!("shutdown during cache refresh");
                            return Ok(());
                        },
                        _ = self.handle_refresh() => {},
                    }
                    self.refresh_timer
                        .restart(self.config.refresh_interval())?;
                },

                // next request from handles
                req = self.rx_req.recv() => {
                    let req = match req {
                        Some(req) => req,
                        None => {
                            pf_debug!("all lease handles dropped");
                            return Ok(());
                        }
                    };
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            pf_debug!("shutdown with a request in flight");
                            return Ok(());
                        },
                        result = self.handle_request(req) => result?,
                    }
                },
            }
        }
    }

    /// Answers everything still queued and every waiter with `Stopped`.
    fn drain(&mut self) {
        self.rx_req.close();
        let mut drained = 0;
        while let Ok(req) = self.rx_req.try_recv() {
            req.reject(LeaseError::Stopped);
            drained += 1;
        }
        if drained > 0 {
            pf_debug!("drained {} queued requests", drained);
        }
        self.waiters.release_all(LeaseError::Stopped);
    }

    /// Runs the coordinator until shutdown or a fatal fault, then drains.
    pub(crate) async fn run(mut self) -> Result<(), LeaseError> {
        pf_debug!(
            "lease coordinator spawned with {} cached leases",
            self.cache.len()
        );

        let result = self.event_loop().await;
        self.drain();

        match result {
            Ok(()) => pf_debug!("lease coordinator exited"),
            Err(ref e) => pf_error!("lease coordinator failed: {}", e),
        }
        result
    }
}
