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

//! An alternative `Runner` for callers that want a bounded footprint: every submitted observer is
//! fed by one shared background thread, round-robin, rather than by a worker pool. Matches the
//! thread-pool runner's feed-loop semantics exactly (same tick, same timeout and shutdown
//! handling) but never shares state with it — the two `Runner`s are deliberately kept as
//! independent implementations behind the same trait instead of one variant with a mode flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::ObserverError;
use crate::observer::ObserverControl;
use crate::runner::{begin_submission, feed_tick, finish_submission, Runner, SubmissionHandle, FEED_TICK};

struct Slot {
    observer: Arc<dyn ObserverControl>,
    stop_flag: Arc<AtomicBool>,
    done_flag: Arc<AtomicBool>,
}

struct Shared {
    slots: Mutex<Vec<Slot>>,
    shutting_down: Arc<AtomicBool>,
}

/// A single-threaded runner: one driver thread visits every live slot once per tick, advancing
/// each observer's feed-loop a step at a time. Suitable for deployments that want a predictable,
/// bounded number of OS threads regardless of how many observers are in flight at once.
pub struct CooperativeRunner {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CooperativeRunner {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            slots: Mutex::new(Vec::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        });

        let driver_shared = Arc::clone(&shared);
        let driver = thread::Builder::new()
            .name("observation-runner-cooperative".into())
            .spawn(move || drive(driver_shared))
            .expect("failed to spawn cooperative runner driver thread");

        CooperativeRunner {
            shared,
            driver: Mutex::new(Some(driver)),
        }
    }
}

impl Default for CooperativeRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn drive(shared: Arc<Shared>) {
    loop {
        let mut slots = mutex_lock_unwrap!(shared.slots);
        slots.retain(|slot| {
            let exited = feed_tick(&slot.observer, &slot.stop_flag, &shared.shutting_down);
            if exited {
                finish_submission(&slot.observer, &slot.done_flag);
            }
            !exited
        });
        let empty = slots.is_empty();
        let shutting_down = shared.shutting_down.load(Ordering::SeqCst);
        drop(slots);

        if empty && shutting_down {
            return;
        }
        thread::sleep(FEED_TICK);
    }
}

impl Runner for CooperativeRunner {
    fn submit(&self, observer: Arc<dyn ObserverControl>) -> Result<SubmissionHandle, ObserverError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            error!("submission rejected: cooperative runner is shutting down");
            observer.cancel();
            return Err(ObserverError::Cancelled);
        }

        let (stop_flag, done_flag) = begin_submission(&observer)?;

        let handle = SubmissionHandle {
            observer: Arc::clone(&observer),
            stop_flag: Arc::clone(&stop_flag),
            done_flag: Arc::clone(&done_flag),
        };

        mutex_lock_unwrap!(self.shared.slots).push(Slot {
            observer,
            stop_flag,
            done_flag,
        });

        Ok(handle)
    }

    fn shutdown(&self) {
        warn!("shutting down cooperative runner, cancelling live observers");
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        if let Some(driver) = mutex_lock_unwrap!(self.driver).take() {
            let _ = driver.join();
        }
    }
}

impl crate::threading::shutdown::ShutdownHandle for CooperativeRunner {
    fn signal_shutdown(&mut self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
    }

    fn wait_for_shutdown(&mut self) -> Result<(), crate::error::InternalError> {
        if let Some(driver) = mutex_lock_unwrap!(self.driver).take() {
            driver.join().map_err(|_| {
                crate::error::InternalError::with_message(
                    "cooperative runner driver thread panicked".into(),
                )
            })?;
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
    fn drives_multiple_observers_concurrently() {
        let runner = CooperativeRunner::new();
        let conn = connection();

        let cmd_a = Command::new(Arc::clone(&conn), "echo a", Duration::from_secs(2), |chunk: &[u8]| {
            if String::from_utf8_lossy(chunk).lines().any(|l| l.trim() == "a") {
                Some(Ok("a".to_string()))
            } else {
                None
            }
        });
        let cmd_b = Command::new(conn, "echo b", Duration::from_secs(2), |chunk: &[u8]| {
            if String::from_utf8_lossy(chunk).lines().any(|l| l.trim() == "b") {
                Some(Ok("b".to_string()))
            } else {
                None
            }
        });
        cmd_a.start().unwrap();
        cmd_b.start().unwrap();

        let observer_a: Arc<dyn ObserverControl> = cmd_a.clone();
        let observer_b: Arc<dyn ObserverControl> = cmd_b.clone();
        let handle_a = runner.submit(observer_a).unwrap();
        let handle_b = runner.submit(observer_b).unwrap();

        cmd_a.data_received(b"a\r\n");
        cmd_b.data_received(b"b\r\n");

        assert!(crate::transport::tests::wait_until(
            || handle_a.done() && handle_b.done(),
            Duration::from_secs(1)
        ));
        assert_eq!(cmd_a.result(), Some("a".to_string()));
        assert_eq!(cmd_b.result(), Some("b".to_string()));

        runner.shutdown();
    }

    #[test]
    fn submit_times_out_without_data() {
        let runner = CooperativeRunner::new();
        let cmd = Command::new(connection(), "echo hi", Duration::from_millis(50), |_: &[u8]| None);
        cmd.start().unwrap();
        let observer: Arc<dyn ObserverControl> = cmd.clone();
        let handle = runner.submit(observer).unwrap();

        assert!(crate::transport::tests::wait_until(
            || handle.done(),
            Duration::from_secs(1)
        ));
        assert_eq!(cmd.exception(), Some(ObserverError::CommandTimeout));
        runner.shutdown();
    }
}
