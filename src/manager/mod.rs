//! The lease manager: a supervised coordinator task plus the namespace-bound
//! handles through which other subsystems use it.

mod cache;
mod coordinator;
mod handles;
mod waiters;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::lease::{Clock, LeaseKey, LeaseStore, Secretary};
use crate::utils::LeaseError;

use cache::{CacheView, LeaseCache};
use coordinator::{CoordinatorTask, Request};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use tokio_util::sync::CancellationToken;

/// Longest sweep or refresh period accepted, in millisecs.
const MAX_INTERVAL_MS: u64 = 24 * 3600 * 1000;

pub use handles::{Checker, Claimer, Pinner, Reader, Revoker, Token};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Expiry sweep tick period in millisecs.
    pub sweep_interval_ms: u64,

    /// Full cache refresh period in millisecs. This is how stale a token
    /// check may be with respect to changes made by other managers.
    pub refresh_interval_ms: u64,

    /// Capacity of the coordinator's inbound request queue.
    pub chan_req_cap: usize,

    /// Consecutive failed sweeps before health is reported degraded.
    pub sweep_failure_alarm: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            sweep_interval_ms: 1000,
            refresh_interval_ms: 10000,
            chan_req_cap: 1024,
            sweep_failure_alarm: 5,
        }
    }
}

impl ManagerConfig {
    /// Sanity checks on the parsed values.
    pub fn validate(&self) -> Result<(), LeaseError> {
        if self.sweep_interval_ms == 0
            || self.sweep_interval_ms > MAX_INTERVAL_MS
        {
            return logged_err!(
                "invalid config.sweep_interval_ms '{}'",
                self.sweep_interval_ms
            );
        }
        if self.refresh_interval_ms < self.sweep_interval_ms
            || self.refresh_interval_ms > MAX_INTERVAL_MS
        {
            return logged_err!(
                "invalid config.refresh_interval_ms '{}'",
                self.refresh_interval_ms
            );
        }
        if self.chan_req_cap == 0 {
            return logged_err!(
                "invalid config.chan_req_cap '{}'",
                self.chan_req_cap
            );
        }
        if self.sweep_failure_alarm == 0 {
            return logged_err!(
                "invalid config.sweep_failure_alarm '{}'",
                self.sweep_failure_alarm
            );
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Health of the expiry sweep, as published to the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerHealth {
    /// Sweeps failed in a row since the last successful one.
    pub consecutive_sweep_failures: u32,

    /// Error of the latest failed sweep, if the last sweep failed.
    pub last_sweep_error: Option<String>,

    /// Set once failures reach the configured alarm threshold; cleared by
    /// the next successful sweep.
    pub degraded: bool,
}

/// Lease manager instance. Owns the coordinator task and hands out
/// namespace-bound handles to it.
pub struct LeaseManager {
    /// Secretaries of every namespace this manager serves.
    secretaries: HashMap<String, Arc<dyn Secretary>>,

    clock: Arc<dyn Clock>,

    /// Sender side of the coordinator's request queue.
    tx_req: mpsc::Sender<Request>,

    /// Read view of the cache, cloned into every checker. Behind a mutex
    /// only because the view itself is not `Sync`.
    view: Mutex<CacheView>,

    /// Cancelled to stop the coordinator.
    shutdown: CancellationToken,

    /// Receiver side of the health channel.
    rx_health: watch::Receiver<ManagerHealth>,

    /// Join handle of the coordinator task.
    coordinator_handle: JoinHandle<Result<(), LeaseError>>,
}

impl LeaseManager {
    /// Creates a new lease manager over `store`, seeds its cache with a full
    /// store read, and spawns the coordinator task. A failing initial read is
    /// returned to the caller.
    pub async fn new_and_setup(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        secretaries: HashMap<String, Arc<dyn Secretary>>,
        config_str: Option<&str>,
    ) -> Result<Self, LeaseError> {
        let config = parsed_config!(config_str => ManagerConfig;
                                    sweep_interval_ms, refresh_interval_ms,
                                    chan_req_cap, sweep_failure_alarm)?;
        config.validate()?;
        if secretaries.is_empty() {
            return logged_err!("no lease namespace registered");
        }

        let snapshot = store.read_all().await?;
        let (cache, view) = LeaseCache::new(snapshot);

        let (tx_req, rx_req) = mpsc::channel(config.chan_req_cap);
        let (tx_health, rx_health) = watch::channel(ManagerHealth::default());
        let shutdown = CancellationToken::new();

        let coordinator = CoordinatorTask::new(
            config,
            store,
            clock.clone(),
            rx_req,
            shutdown.clone(),
            cache,
            tx_health,
        )?;
        let coordinator_handle = tokio::spawn(coordinator.run());

        Ok(LeaseManager {
            secretaries,
            clock,
            tx_req,
            view: Mutex::new(view),
            shutdown,
            rx_health,
            coordinator_handle,
        })
    }

    fn secretary(&self, namespace: &str) -> Result<Arc<dyn Secretary>, LeaseError> {
        self.secretaries
            .get(namespace)
            .cloned()
            .ok_or_else(|| LeaseError::InvalidNamespace(namespace.into()))
    }

    fn view(&self) -> Result<CacheView, LeaseError> {
        self.view
            .lock()
            .map(|view| view.clone())
            .map_err(|e| LeaseError::msg(format!("cache view poisoned: {}", e)))
    }

    /// Returns a claimer for the given namespace.
    pub fn claimer(&self, namespace: &str) -> Result<Claimer, LeaseError> {
        let secretary = self.secretary(namespace)?;
        Ok(Claimer::new(
            namespace.into(),
            secretary,
            self.tx_req.clone(),
        ))
    }

    /// Returns a checker for the given namespace.
    pub fn checker(&self, namespace: &str) -> Result<Checker, LeaseError> {
        let secretary = self.secretary(namespace)?;
        Ok(Checker::new(
            namespace.into(),
            secretary,
            self.view()?,
            self.clock.clone(),
        ))
    }

    /// Returns a revoker for the given namespace.
    pub fn revoker(&self, namespace: &str) -> Result<Revoker, LeaseError> {
        let secretary = self.secretary(namespace)?;
        Ok(Revoker::new(
            namespace.into(),
            secretary,
            self.tx_req.clone(),
        ))
    }

    /// Returns a pinner for the given namespace.
    pub fn pinner(&self, namespace: &str) -> Result<Pinner, LeaseError> {
        let secretary = self.secretary(namespace)?;
        Ok(Pinner::new(namespace.into(), secretary, self.tx_req.clone()))
    }

    /// Returns a reader for the given namespace.
    pub fn reader(&self, namespace: &str) -> Result<Reader, LeaseError> {
        self.secretary(namespace)?;
        Ok(Reader::new(namespace.into(), self.tx_req.clone()))
    }

    /// Blocks until lease `name` of `namespace` is absent (revoked, reaped by
    /// a sweep, or gone from the store), or until `cancel` fires, in which
    /// case `WaitCancelled` is returned right away regardless of how busy the
    /// coordinator is. If given, `started` is signalled once the wait is
    /// registered; a lease freed after that point is never missed.
    pub async fn wait_until_expired(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
        started: Option<oneshot::Sender<()>>,
    ) -> Result<(), LeaseError> {
        let secretary = self.secretary(namespace)?;
        secretary.check_lease(name)?;

        let (tx_done, rx_done) = oneshot::channel();
        let req = Request::Wait {
            key: LeaseKey::new(namespace, name),
            tx_done,
            tx_started: started,
        };

        // dropping `rx_done` on cancellation detaches the waiter; the
        // coordinator prunes it later
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LeaseError::WaitCancelled),
            sent = self.tx_req.send(req) => sent?,
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LeaseError::WaitCancelled),
            done = rx_done => done?,
        }
    }

    /// Returns a receiver of the manager's health updates.
    pub fn health(&self) -> watch::Receiver<ManagerHealth> {
        self.rx_health.clone()
    }

    /// Requests the coordinator to stop. Queued requests and pending waiters
    /// are answered with `Stopped`.
    pub fn kill(&self) {
        pf_debug!("lease manager killed");
        self.shutdown.cancel();
    }

    /// Waits for the coordinator task to exit and returns its result, which
    /// is `Err(Invariant)` if it died of a fatal fault.
    pub async fn wait(self) -> Result<(), LeaseError> {
        match self.coordinator_handle.await {
            Ok(result) => result,
            Err(e) => {
                logged_err!("lease coordinator join error: {}", e)
            }
        }
    }
}
