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

//! The primary `Runner`: one feed-loop task per submitted observer, run on a panic-safe worker
//! pool so multiple observers are fed in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::ObserverError;
use crate::observer::ObserverControl;
use crate::runner::{begin_submission, feed_tick, finish_submission, Runner, SubmissionHandle, FEED_TICK};
use crate::threading::pool::{ThreadPool, ThreadPoolBuilder};

pub struct ThreadPoolRunner {
    pool: ThreadPool,
    shutting_down: Arc<AtomicBool>,
    live: Mutex<Vec<Weak<SubmissionHandle>>>,
}

impl ThreadPoolRunner {
    pub fn new(worker_count: usize) -> Result<Self, crate::error::InternalError> {
        let pool = ThreadPoolBuilder::new()
            .with_size(worker_count)
            .with_prefix("observation-runner".to_string())
            .build()
            .map_err(|err| crate::error::InternalError::with_message(err.to_string()))?;
        Ok(ThreadPoolRunner {
            pool,
            shutting_down: Arc::new(AtomicBool::new(false)),
            live: Mutex::new(Vec::new()),
        })
    }
}

impl Runner for ThreadPoolRunner {
    fn submit(&self, observer: Arc<dyn ObserverControl>) -> Result<SubmissionHandle, ObserverError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            error!("submission rejected: thread pool runner is shutting down");
            observer.cancel();
            return Err(ObserverError::Cancelled);
        }

        let (stop_flag, done_flag) = begin_submission(&observer)?;

        let feed_observer = Arc::clone(&observer);
        let feed_stop = Arc::clone(&stop_flag);
        let feed_done = Arc::clone(&done_flag);
        let shutting_down = Arc::clone(&self.shutting_down);

        self.pool.executor().execute(move || loop {
            if feed_tick(&feed_observer, &feed_stop, &shutting_down) {
                finish_submission(&feed_observer, &feed_done);
                break;
            }
            std::thread::sleep(FEED_TICK);
        });

        let handle = Arc::new(SubmissionHandle {
            observer,
            stop_flag,
            done_flag,
        });
        mutex_lock_unwrap!(self.live).push(Arc::downgrade(&handle));
        Ok(Arc::try_unwrap(handle).unwrap_or_else(|arc| SubmissionHandle {
            observer: Arc::clone(&arc.observer),
            stop_flag: Arc::clone(&arc.stop_flag),
            done_flag: Arc::clone(&arc.done_flag),
        }))
    }

    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("shutting down thread pool runner, cancelling live observers");
        let live = mutex_lock_unwrap!(self.live);
        for weak in live.iter() {
            if let Some(handle) = weak.upgrade() {
                let _ = handle.cancel(true, crate::runner::DEFAULT_STOP_TIMEOUT);
            }
        }
    }
}

impl crate::threading::shutdown::ShutdownHandle for ThreadPoolRunner {
    fn signal_shutdown(&mut self) {
        Runner::shutdown(self);
    }

    fn wait_for_shutdown(&mut self) -> Result<(), crate::error::InternalError> {
        let live = mutex_lock_unwrap!(self.live);
        for weak in live.iter() {
            if let Some(handle) = weak.upgrade() {
                handle.cancel(false, crate::runner::DEFAULT_STOP_TIMEOUT)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MolerConnection;
    use crate::observer::Command;
    use crate::transport::memory::MemoryTransport;
    use std::time::Duration;

    fn connection() -> Arc<MolerConnection> {
        let (transport, _handle) = MemoryTransport::new_pair();
        let conn = Arc::new(MolerConnection::new(Box::new(transport)));
        MolerConnection::open(&conn).unwrap();
        conn
    }

    #[test]
    fn submit_feeds_observer_to_completion() {
        let runner = ThreadPoolRunner::new(2).unwrap();
        let conn = connection();
        let cmd = Command::new(conn, "echo hi", Duration::from_secs(2), |chunk: &[u8]| {
            if String::from_utf8_lossy(chunk).lines().any(|l| l.trim() == "hi") {
                Some(Ok("hi".to_string()))
            } else {
                None
            }
        });
        cmd.start().unwrap();
        let observer: Arc<dyn ObserverControl> = cmd.clone();
        let handle = runner.submit(observer).unwrap();

        cmd.data_received(b"hi\r\n");

        assert!(crate::transport::tests::wait_until(
            || handle.done(),
            Duration::from_secs(1)
        ));
        assert_eq!(cmd.result(), Some("hi".to_string()));
    }

    #[test]
    fn submit_times_out_without_data() {
        let runner = ThreadPoolRunner::new(2).unwrap();
        let conn = connection();
        let cmd = Command::new(conn, "echo hi", Duration::from_millis(50), |_: &[u8]| None);
        cmd.start().unwrap();
        let observer: Arc<dyn ObserverControl> = cmd.clone();
        let handle = runner.submit(observer).unwrap();

        assert!(crate::transport::tests::wait_until(
            || handle.done(),
            Duration::from_secs(1)
        ));
        assert_eq!(cmd.exception(), Some(ObserverError::CommandTimeout));
    }

    #[test]
    fn extending_timeout_before_expiry_survives_the_original_deadline() {
        let runner = ThreadPoolRunner::new(2).unwrap();
        let conn = connection();
        let cmd = Command::new(conn, "echo hi", Duration::from_millis(80), |_: &[u8]| None);
        cmd.start().unwrap();
        let observer: Arc<dyn ObserverControl> = cmd.clone();
        observer.set_timeout(Duration::from_secs(2));
        let handle = runner.submit(observer).unwrap();

        // Sleep past the original 80ms deadline; the extension must have prevented a timeout.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!handle.done());
        assert_eq!(cmd.status(), crate::observer::ObserverStatus::Running);

        let _ = handle.cancel(false, crate::runner::DEFAULT_STOP_TIMEOUT);
    }

    #[test]
    fn shrinking_timeout_below_elapsed_times_out_on_next_tick() {
        let runner = ThreadPoolRunner::new(2).unwrap();
        let conn = connection();
        let cmd = Command::new(conn, "echo hi", Duration::from_secs(5), |_: &[u8]| None);
        cmd.start().unwrap();
        let observer: Arc<dyn ObserverControl> = cmd.clone();
        let handle = runner.submit(observer.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        // Shrink the deadline to below what has already elapsed: the next feed tick must time
        // this observer out rather than waiting for the original 5s deadline.
        observer.set_timeout(Duration::from_millis(10));

        assert!(crate::transport::tests::wait_until(
            || handle.done(),
            Duration::from_secs(1)
        ));
        assert_eq!(cmd.exception(), Some(ObserverError::CommandTimeout));
    }

    #[test]
    fn shutdown_cancels_live_observers() {
        let runner = ThreadPoolRunner::new(2).unwrap();
        let conn = connection();
        let cmd = Command::new(conn, "echo hi", Duration::from_secs(5), |_: &[u8]| None);
        cmd.start().unwrap();
        let observer: Arc<dyn ObserverControl> = cmd.clone();
        let handle = runner.submit(observer).unwrap();

        runner.shutdown();

        assert!(crate::transport::tests::wait_until(
            || handle.done(),
            Duration::from_secs(1)
        ));
    }
}
