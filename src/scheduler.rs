// Copyright 2018-2022 Cargill Incorporated
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Periodic callback scheduling, grounded in the source project's `apscheduler`-backed
//! `Scheduler`/`Job` pair but hand-rolled here: a background driver thread walks the job table on
//! a fixed tick, and ready jobs are dispatched to a small worker pool so one slow callback doesn't
//! delay the scheduling decision for the others. A job still busy with its previous tick simply
//! has the next one dropped rather than queued, matching the source's one-instance-at-a-time
//! scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::SchedulerError;
use crate::threading::pool::{ThreadPool, ThreadPoolBuilder};

/// How often the driver thread re-walks the job table to check for ready jobs.
const DRIVER_TICK: Duration = Duration::from_millis(20);

struct JobState {
    interval: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    cancel_on_exception: bool,
    paused: AtomicBool,
    running: AtomicBool,
    next_fire: Mutex<Instant>,
}

/// A handle to one periodic registration. Created paused; call `start()` to begin ticking.
#[derive(Clone)]
pub struct Job {
    state: Arc<JobState>,
}

impl Job {
    pub fn start(&self) {
        *mutex_lock_unwrap!(self.state.next_fire) = Instant::now() + self.state.interval;
        self.state.paused.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }
}

static SCHEDULER_EXISTS: AtomicBool = AtomicBool::new(false);

/// Drives every registered `Job` from one background thread. At most one `Scheduler` may exist
/// per process at a time (constructing a second while the first is alive is `WrongUsage`,
/// grounded in the source's `_lock`-guarded singleton) — callers that need an isolated scheduler
/// for a test let the previous one drop first rather than reaching for a bare global.
pub struct Scheduler {
    jobs: Mutex<Vec<Arc<JobState>>>,
    pool: ThreadPool,
    shutting_down: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Result<Arc<Self>, SchedulerError> {
        if SCHEDULER_EXISTS.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::WrongUsage(
                "Scheduler already created; cannot construct more than one instance at a time".into(),
            ));
        }

        let pool = ThreadPoolBuilder::new()
            .with_size(4)
            .with_prefix("scheduler-worker".to_string())
            .build()
            .map_err(|err| {
                SCHEDULER_EXISTS.store(false, Ordering::SeqCst);
                SchedulerError::WrongUsage(format!("failed to start scheduler worker pool: {}", err))
            })?;

        let jobs: Mutex<Vec<Arc<JobState>>> = Mutex::new(Vec::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        Ok(Arc::new(Scheduler {
            jobs,
            pool,
            shutting_down,
            driver: Mutex::new(None),
        }))
    }

    /// Registers a callback that fires every `interval` once the returned `Job` is started. The
    /// job is created paused; `callback_params` binding (present in the source's dict-of-kwargs
    /// form) is achieved here by closing over whatever state the caller's closure needs.
    pub fn get_job(
        self: &Arc<Self>,
        callback: impl Fn() + Send + Sync + 'static,
        interval: Duration,
        cancel_on_exception: bool,
    ) -> Job {
        let state = Arc::new(JobState {
            interval,
            callback: Arc::new(callback),
            cancel_on_exception,
            paused: AtomicBool::new(true),
            running: AtomicBool::new(false),
            next_fire: Mutex::new(Instant::now() + interval),
        });

        mutex_lock_unwrap!(self.jobs).push(Arc::clone(&state));
        self.ensure_driver();

        Job { state }
    }

    fn ensure_driver(self: &Arc<Self>) {
        let mut driver = mutex_lock_unwrap!(self.driver);
        if driver.is_some() {
            return;
        }
        let scheduler = Arc::clone(self);
        *driver = Some(
            thread::Builder::new()
                .name("scheduler-driver".into())
                .spawn(move || drive(scheduler))
                .expect("failed to spawn scheduler driver thread"),
        );
    }

    pub fn shutdown(&self) {
        warn!("shutting down scheduler");
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(driver) = mutex_lock_unwrap!(self.driver).take() {
            let _ = driver.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        SCHEDULER_EXISTS.store(false, Ordering::SeqCst);
    }
}

fn drive(scheduler: Arc<Scheduler>) {
    while !scheduler.shutting_down.load(Ordering::SeqCst) {
        let ready: Vec<Arc<JobState>> = {
            let jobs = mutex_lock_unwrap!(scheduler.jobs);
            let now = Instant::now();
            jobs.iter()
                .filter(|job| {
                    if job.paused.load(Ordering::SeqCst) {
                        return false;
                    }
                    let due = *mutex_lock_unwrap!(job.next_fire) <= now;
                    if due && job.running.load(Ordering::SeqCst) {
                        debug!("dropping overlapping tick: previous invocation still running");
                        return false;
                    }
                    due
                })
                .cloned()
                .collect()
        };

        for job in ready {
            *mutex_lock_unwrap!(job.next_fire) = Instant::now() + job.interval;
            job.running.store(true, Ordering::SeqCst);
            let job_for_worker = Arc::clone(&job);
            scheduler.pool.executor().execute(move || {
                run_tick(&job_for_worker);
            });
        }

        thread::sleep(DRIVER_TICK);
    }
}

fn run_tick(job: &Arc<JobState>) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (job.callback)()));
    if outcome.is_err() {
        error!("scheduled job callback panicked");
        if job.cancel_on_exception {
            warn!("pausing job after callback panic (cancel_on_exception)");
            job.paused.store(true, Ordering::SeqCst);
        }
    }
    job.running.store(false, Ordering::SeqCst);
}
