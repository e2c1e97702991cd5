//! Leaseman lease contention stress driver.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{self, LevelFilter};
use rand::Rng;
use leaseman::{
    logged_err, logger_init, pf_error, pf_info, standard_secretaries, Checker,
    Claimer, LeaseError, LeaseManager, MemStore, Revoker, WallClock,
    LEADERSHIP_NAMESPACE,
};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Number of distinct leases contended for.
    #[arg(short, long, default_value_t = 8)]
    leases: usize,

    /// Number of concurrent holder tasks.
    #[arg(short = 'n', long, default_value_t = 16)]
    holders: usize,

    /// Duration of each claim in millisecs.
    #[arg(short, long, default_value_t = 2000)]
    duration_ms: u64,

    /// Total running time in seconds.
    #[arg(short, long, default_value_t = 10)]
    secs: u64,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(LeaseError)` on any error.
    fn sanitize(&self) -> Result<(), LeaseError> {
        if self.leases == 0 {
            Err(LeaseError::msg(format!(
                "invalid number of leases {}",
                self.leases
            )))
        } else if self.holders < 2 {
            Err(LeaseError::msg(format!(
                "invalid number of holders {}",
                self.holders
            )))
        } else if self.duration_ms == 0 {
            Err(LeaseError::msg(format!(
                "invalid claim duration {}",
                self.duration_ms
            )))
        } else if self.secs == 0 {
            Err(LeaseError::msg(format!(
                "invalid running time {}",
                self.secs
            )))
        } else if self.threads < 2 {
            Err(LeaseError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Counters of one holder task.
#[derive(Debug, Default, Clone, Copy)]
struct HolderStats {
    claims_won: u64,
    claims_denied: u64,
    checks_passed: u64,
    revokes: u64,
}

/// Holders seen passing a token check, per lease and cache version. Two
/// different holders under the same entry mean exclusion was broken.
type PassLedger = Arc<Mutex<HashMap<(String, u64), String>>>;

/// Returns true if recording this pass contradicts an earlier one.
fn record_pass(
    ledger: &PassLedger,
    lease: &str,
    version: u64,
    holder: &str,
) -> Result<bool, LeaseError> {
    let mut ledger = ledger
        .lock()
        .map_err(|e| LeaseError::msg(format!("ledger poisoned: {}", e)))?;
    let seen = ledger
        .entry((lease.into(), version))
        .or_insert_with(|| holder.into());
    Ok(seen.as_str() != holder)
}

/// Loop of one holder task: claim a random lease, check the token, and
/// every now and then give the lease up.
#[allow(clippy::too_many_arguments)]
async fn holder_loop(
    holder: String,
    claimer: Claimer,
    checker: Checker,
    revoker: Revoker,
    num_leases: usize,
    duration: Duration,
    until: Instant,
    ledger: PassLedger,
    mut rx_term: watch::Receiver<bool>,
) -> Result<HolderStats, LeaseError> {
    let mut stats = HolderStats::default();

    while Instant::now() < until && !*rx_term.borrow() {
        let (lease, jitter, give_up) = {
            let mut rng = rand::thread_rng();
            (
                format!("app{}", rng.gen_range(0..num_leases)),
                Duration::from_millis(rng.gen_range(1..10)),
                rng.gen_bool(0.2),
            )
        };

        match claimer.claim(&lease, &holder, duration).await {
            Ok(()) => {
                stats.claims_won += 1;
                let token = checker.token(&lease, &holder);
                if token.check().is_ok() {
                    stats.checks_passed += 1;
                    if record_pass(
                        &ledger,
                        &lease,
                        token.cache_version(),
                        &holder,
                    )? {
                        return logged_err!(
                            "{} passed check on {} at version {} held by another",
                            holder,
                            lease,
                            token.cache_version()
                        );
                    }
                }
                if give_up {
                    match revoker.revoke(&lease, &holder).await {
                        Ok(()) => stats.revokes += 1,
                        // reaped in between
                        Err(LeaseError::NotHeld) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(LeaseError::LeaseHeld) => stats.claims_denied += 1,
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = time::sleep(jitter) => {},
            _ = rx_term.changed() => break,
        }
    }

    Ok(stats)
}

/// Actual main function of the stress driver.
fn bench_main() -> Result<(), LeaseError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(|e| LeaseError::msg(format!("ctrlc handler: {}", e)))?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-bench")
            .build()?;

        // enter tokio runtime, setup the manager, and run holder tasks until
        // the time is up or a termination signal arrives
        runtime.block_on(async move {
            let manager = LeaseManager::new_and_setup(
                Arc::new(MemStore::new()),
                Arc::new(WallClock),
                standard_secretaries(),
                None,
            )
            .await?;

            let until = Instant::now() + Duration::from_secs(args.secs);
            let ledger = PassLedger::default();
            let mut holder_handles = Vec::with_capacity(args.holders);
            for h in 0..args.holders {
                holder_handles.push(tokio::spawn(holder_loop(
                    format!("bench/{}", h),
                    manager.claimer(LEADERSHIP_NAMESPACE)?,
                    manager.checker(LEADERSHIP_NAMESPACE)?,
                    manager.revoker(LEADERSHIP_NAMESPACE)?,
                    args.leases,
                    Duration::from_millis(args.duration_ms),
                    until,
                    ledger.clone(),
                    rx_term.clone(),
                )));
            }

            let mut total = HolderStats::default();
            for handle in holder_handles {
                let stats = handle.await.map_err(LeaseError::msg)??;
                total.claims_won += stats.claims_won;
                total.claims_denied += stats.claims_denied;
                total.checks_passed += stats.checks_passed;
                total.revokes += stats.revokes;
            }
            pf_info!(
                "claims won {} denied {}, checks passed {}, revokes {}",
                total.claims_won,
                total.claims_denied,
                total.checks_passed,
                total.revokes
            );

            manager.kill();
            manager.wait().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), LeaseError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the stress driver.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = bench_main() {
        pf_error!("bench_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
