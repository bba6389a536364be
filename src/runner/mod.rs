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

//! `Runner` hides the concurrency model behind one small interface so the same `Observer`s work
//! whether fed by a worker pool (`ThreadPoolRunner`) or by a single cooperative thread
//! (`CooperativeRunner`). The two never share observer state (see the design notes on mixed
//! runner variants) — a `Device` is bound to exactly one for its lifetime.

pub mod cooperative;
pub mod thread_pool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{InternalError, ObserverError};
use crate::observer::{ObserverControl, ObserverKind};

/// Default bound on how long `cancel(no_wait=false)` waits for a feed-loop to observe its stop
/// flag, grounded in the 0.5s `stop_timeout` of the system this crate's runner model is patterned
/// on.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// The feed-loop tick: how often a feed-loop re-checks stop/done/deadline.
pub const FEED_TICK: Duration = Duration::from_millis(5);

/// The `wait_for` poll tick used when the caller supplies no explicit timeout.
pub const WAIT_FOR_TICK: Duration = Duration::from_millis(100);

/// A cancellable handle to a submitted observer's feed-loop.
pub struct SubmissionHandle {
    observer: Arc<dyn ObserverControl>,
    stop_flag: Arc<AtomicBool>,
    done_flag: Arc<AtomicBool>,
}

impl SubmissionHandle {
    pub fn done(&self) -> bool {
        self.done_flag.load(Ordering::SeqCst) || self.observer.done()
    }

    /// `no_wait=true`: set the stop flag and return immediately. `no_wait=false`: additionally
    /// wait up to `stop_timeout` for the feed-loop to report `done_flag`; failing to stop within
    /// that bound is a fatal `InternalError`.
    pub fn cancel(&self, no_wait: bool, stop_timeout: Duration) -> Result<(), InternalError> {
        self.observer.cancel();
        self.stop_flag.store(true, Ordering::SeqCst);
        if no_wait {
            return Ok(());
        }
        let start = Instant::now();
        while start.elapsed() < stop_timeout {
            if self.done_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.done_flag.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(InternalError::with_message(format!(
                "feed-loop failed to stop within {:?}",
                stop_timeout
            )))
        }
    }
}

/// The concurrency driver that feeds observers: subscribes them to their connection, drives
/// them to completion in the background, enforces the per-observer timeout, and surfaces the
/// result through the returned `SubmissionHandle`.
pub trait Runner: Send + Sync {
    /// Subscribes a guarded receiver for `observer`, sends its command line if it is a Command,
    /// and enqueues the feed-loop. `observer.start()` must already have been called.
    fn submit(&self, observer: Arc<dyn ObserverControl>) -> Result<SubmissionHandle, ObserverError>;

    /// Blocks until `observer` is terminal. If `timeout` is given, blocks at most that long;
    /// otherwise polls the observer's own (mutable) timeout in `WAIT_FOR_TICK` ticks.
    fn wait_for(&self, handle: &SubmissionHandle, timeout: Option<Duration>) {
        if handle.done() {
            let _ = handle.cancel(true, DEFAULT_STOP_TIMEOUT);
            return;
        }
        let start = Instant::now();
        loop {
            if handle.done() {
                return;
            }
            let remaining_deadline = handle
                .observer
                .start_time()
                .map(|start_time| {
                    handle
                        .observer
                        .timeout()
                        .saturating_sub(start_time.elapsed())
                })
                .unwrap_or(Duration::from_secs(0));

            let budget = match timeout {
                Some(explicit) => {
                    let remaining_explicit = explicit.saturating_sub(start.elapsed());
                    std::cmp::min(remaining_explicit, remaining_deadline)
                }
                None => remaining_deadline,
            };

            if budget.is_zero() {
                handle.observer.mark_timed_out();
                let _ = handle.cancel(false, DEFAULT_STOP_TIMEOUT);
                return;
            }

            std::thread::sleep(std::cmp::min(budget, WAIT_FOR_TICK));

            if let Some(explicit) = timeout {
                if start.elapsed() >= explicit {
                    handle.observer.mark_timed_out();
                    let _ = handle.cancel(false, DEFAULT_STOP_TIMEOUT);
                    return;
                }
            }
        }
    }

    /// Notification hook for runners whose scheduling model needs to reshape deadlines when an
    /// observer's timeout changes mid-flight. The default thread-pool and cooperative runners
    /// both re-read the timeout every tick, so neither needs to act on this.
    fn timeout_change(&self, _delta: Duration) {}

    /// Idempotent. Cancels every not-yet-done observer owned by this runner and stops accepting
    /// new submissions.
    fn shutdown(&self);
}

/// Shared submission bookkeeping used by both concrete runners: installs the guarded receiver,
/// sends the command line, and returns the bits each runner's feed-loop needs.
pub(crate) fn begin_submission(
    observer: &Arc<dyn ObserverControl>,
) -> Result<(Arc<AtomicBool>, Arc<AtomicBool>), ObserverError> {
    if observer.start_time().is_none() {
        return Err(ObserverError::Parse(
            "observer must be started before submission".into(),
        ));
    }

    let stop_flag = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::new(AtomicBool::new(false));

    let guarded = Arc::clone(observer);
    let subscriber_stop = Arc::clone(&stop_flag);
    let connection = observer.connection();
    connection.subscribe(
        observer.subscriber_id(),
        Arc::new(move |chunk: &[u8]| {
            if subscriber_stop.load(Ordering::SeqCst) || guarded.done() {
                return;
            }
            guarded.data_received(chunk);
        }),
    );

    if observer.kind() == ObserverKind::Command {
        if let Some(command_string) = observer.command_string() {
            if let Err(err) = observer.connection().send_line(&command_string) {
                observer.set_exception(err.into());
            }
        }
    }

    Ok((stop_flag, done_flag))
}

/// One iteration of a feed-loop: returns `true` when the loop should exit (and the caller should
/// unsubscribe and set `done_flag`).
pub(crate) fn feed_tick(
    observer: &Arc<dyn ObserverControl>,
    stop_flag: &AtomicBool,
    shutting_down: &AtomicBool,
) -> bool {
    if stop_flag.load(Ordering::SeqCst) {
        return true;
    }
    if observer.done() {
        return true;
    }
    if shutting_down.load(Ordering::SeqCst) {
        warn!("cancelling observer {:?} for runner shutdown", observer.kind());
        observer.cancel();
        return true;
    }
    if let Some(start_time) = observer.start_time() {
        if start_time.elapsed() >= observer.timeout() {
            observer.mark_timed_out();
            return true;
        }
    }
    false
}

pub(crate) fn finish_submission(observer: &Arc<dyn ObserverControl>, done_flag: &AtomicBool) {
    observer.connection().unsubscribe(observer.subscriber_id());
    done_flag.store(true, Ordering::SeqCst);
    info!("observer finished: {:?} {:?}", observer.kind(), observer.status());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MolerConnection;
    use crate::observer::Command;
    use crate::transport::memory::MemoryTransport;

    fn connection() -> Arc<MolerConnection> {
        let (transport, _handle) = MemoryTransport::new_pair();
        Arc::new(MolerConnection::new(Box::new(transport)))
    }

    #[test]
    fn feed_tick_exits_on_deadline() {
        let cmd = Command::new(connection(), "echo hi", Duration::from_millis(1), |_: &[u8]| None);
        cmd.start().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let observer: Arc<dyn ObserverControl> = cmd.clone();
        let stop = AtomicBool::new(false);
        let shutting_down = AtomicBool::new(false);
        assert!(feed_tick(&observer, &stop, &shutting_down));
        assert_eq!(cmd.exception(), Some(ObserverError::CommandTimeout));
    }

    #[test]
    fn feed_tick_cancels_on_shutdown() {
        let cmd = Command::new(connection(), "echo hi", Duration::from_secs(5), |_: &[u8]| None);
        cmd.start().unwrap();
        let observer: Arc<dyn ObserverControl> = cmd.clone();
        let stop = AtomicBool::new(false);
        let shutting_down = AtomicBool::new(true);
        assert!(feed_tick(&observer, &stop, &shutting_down));
        assert_eq!(cmd.status(), crate::observer::ObserverStatus::Cancelled);
    }
}
