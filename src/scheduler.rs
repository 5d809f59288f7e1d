use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

type JobFn = Arc<dyn Fn() + Send + Sync>;

struct PeriodicJob {
    name: String,
    interval: Duration,
    run: JobFn,
}

/// Runs named jobs on independent fixed intervals until shut down.
///
/// Each job gets its own tokio task. A run that panics is logged and the job keeps its schedule.
/// [Scheduler::shutdown] signals every task and waits for in-flight runs before returning.
pub struct Scheduler {
    jobs: Vec<PeriodicJob>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Scheduler {
            jobs: Vec::new(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Adds a job that runs every `interval`, the first time one interval after
    /// [Scheduler::start]. Jobs registered after start are not scheduled, and a zero interval is
    /// refused with a warning.
    pub fn register_periodic<F>(&mut self, name: impl Into<String>, interval: Duration, job: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        if interval.is_zero() {
            warn!("background job {} has a zero interval and will not be scheduled", name);
            return;
        }
        self.jobs.push(PeriodicJob {
            name,
            interval,
            run: Arc::new(job),
        });
    }

    /// Spawns one task per registered job. Must be called from within a tokio runtime. Calling
    /// it on a running scheduler does nothing.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = self.handles.lock();
        for job in &self.jobs {
            let name = job.name.clone();
            let period = job.interval;
            let run = Arc::clone(&job.run);
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            handles.push(tokio::spawn(async move {
                let mut ticker = time::interval_at(time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if panic::catch_unwind(AssertUnwindSafe(|| (*run)())).is_err() {
                                warn!("background job {} panicked; it will run again next interval", name);
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("background job {} stopping", name);
                            break;
                        }
                    }
                }
            }));
        }
        let count = handles.len();
        drop(handles);

        info!("scheduler started with {} jobs", count);
    }

    /// Stops every job and waits for runs in progress to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("background job task ended abnormally: {}", e);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|job| job.name.as_str()).collect()
    }
}
