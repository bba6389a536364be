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

//! Observers are passive state containers: commands that write a line then parse a reply, and
//! events that only ever parse. Neither owns a thread — the `Runner` drives them.
//!
//! `ObserverControl` is the object-safe half of an observer's contract, the part the `Runner`
//! and `MolerConnection` need to drive lifecycle without knowing the observer's concrete output
//! type. The typed result lives on the concrete `Command<O>` / `Event<O>` the caller already
//! holds an `Arc` to, so retrieving it never needs a trait object downcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::connection::{MolerConnection, SubscriberId};
use crate::error::ObserverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverStatus {
    Pending,
    Running,
    DoneOk,
    DoneErr,
    Cancelled,
    TimedOut,
}

impl ObserverStatus {
    pub fn is_done(self) -> bool {
        !matches!(self, ObserverStatus::Pending | ObserverStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverKind {
    Command,
    Event,
}

/// A pre-start predicate installed by `Device::get_cmd`/`get_event` (see §9's start-guard,
/// replacing the source's monkey-patched `_validate_start`). Returns `Ok(())` to allow `start()`
/// to proceed or an error to reject it.
pub type StartGuard = Box<dyn Fn() -> Result<(), ObserverError> + Send + Sync>;

/// An extension hook fired exactly once when the `Runner` forces an observer into `timed_out`.
/// Unset by default; set with `Command::set_on_timeout`/`Event::set_on_timeout` for callers that
/// want to react to a timeout (logging, cleanup) beyond the terminal status transition itself.
pub type TimeoutHook = Box<dyn Fn() + Send + Sync>;

struct Inner<O> {
    status: ObserverStatus,
    result: Option<O>,
    exception: Option<ObserverError>,
}

/// The object-safe lifecycle surface the `Runner` and `MolerConnection` operate on.
pub trait ObserverControl: Send + Sync {
    fn kind(&self) -> ObserverKind;
    fn command_string(&self) -> Option<String>;
    fn connection(&self) -> Arc<MolerConnection>;
    fn subscriber_id(&self) -> SubscriberId;

    fn status(&self) -> ObserverStatus;
    fn done(&self) -> bool {
        self.status().is_done()
    }

    fn start_time(&self) -> Option<Instant>;
    fn timeout(&self) -> Duration;
    fn set_timeout(&self, timeout: Duration);

    /// Records `start_time` and runs the start guard. Idempotent: a second call fails.
    fn start(&self) -> Result<(), ObserverError>;

    /// Pure parser hook; must not block. Ignored once `done()`.
    fn data_received(&self, chunk: &[u8]);

    fn cancel(&self);

    /// Forces a terminal `timed_out`/`done_err` transition; idempotent, only takes effect if not
    /// already done. Fired by the `Runner`'s feed-loop exactly once.
    fn mark_timed_out(&self);

    /// Installs the `on_timeout` extension hook. A later call replaces an earlier one.
    fn set_on_timeout_hook(&self, hook: TimeoutHook);

    fn set_exception(&self, error: ObserverError);
}

/// Shared state machinery for `Command<O>` and `Event<O>`; both wrap this with the remaining
/// parse-specific behavior (`Parser::on_chunk`).
struct ObserverCore<O> {
    connection: Arc<MolerConnection>,
    subscriber_id: SubscriberId,
    kind: ObserverKind,
    command_string: Option<String>,
    start_guard: Mutex<Option<StartGuard>>,
    on_timeout: Mutex<Option<TimeoutHook>>,
    started: AtomicBool,
    start_time: Mutex<Option<Instant>>,
    timeout: Mutex<Duration>,
    inner: Mutex<Inner<O>>,
}

impl<O> ObserverCore<O> {
    fn new(
        connection: Arc<MolerConnection>,
        kind: ObserverKind,
        command_string: Option<String>,
        timeout: Duration,
        start_guard: Option<StartGuard>,
    ) -> Self {
        ObserverCore {
            connection,
            subscriber_id: SubscriberId::new(),
            kind,
            command_string,
            start_guard: Mutex::new(start_guard),
            on_timeout: Mutex::new(None),
            started: AtomicBool::new(false),
            start_time: Mutex::new(None),
            timeout: Mutex::new(timeout),
            inner: Mutex::new(Inner {
                status: ObserverStatus::Pending,
                result: None,
                exception: None,
            }),
        }
    }

    fn status(&self) -> ObserverStatus {
        mutex_lock_unwrap!(self.inner).status
    }

    /// Returns `true` iff this call performed the transition (the observer was not already
    /// done); callers that must fire a once-only side effect (the `on_timeout` hook) on this
    /// condition.
    fn set_terminal(&self, status: ObserverStatus, result: Option<O>, exception: Option<ObserverError>) -> bool {
        let mut inner = mutex_lock_unwrap!(self.inner);
        if inner.status.is_done() {
            return false;
        }
        inner.status = status;
        inner.result = result;
        inner.exception = exception;
        true
    }

    fn set_on_timeout_hook(&self, hook: TimeoutHook) {
        *mutex_lock_unwrap!(self.on_timeout) = Some(hook);
    }

    /// Invoked after a `set_terminal` transition into `timed_out` actually took effect.
    fn fire_on_timeout(&self) {
        if let Some(hook) = mutex_lock_unwrap!(self.on_timeout).as_ref() {
            hook();
        }
    }

    fn start(&self) -> Result<(), ObserverError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ObserverError::Parse("observer already started".into()));
        }
        if let Some(guard) = mutex_lock_unwrap!(self.start_guard).as_ref() {
            guard()?;
        }
        *mutex_lock_unwrap!(self.start_time) = Some(Instant::now());
        let mut inner = mutex_lock_unwrap!(self.inner);
        if inner.status == ObserverStatus::Pending {
            inner.status = ObserverStatus::Running;
        }
        Ok(())
    }
}

/// A Command observer: writes `command_string` on start, then parses the reply until `parser`
/// yields a result.
pub struct Command<O: Send + 'static> {
    core: ObserverCore<O>,
    parser: Mutex<Box<dyn FnMut(&[u8]) -> Option<Result<O, ObserverError>> + Send>>,
}

impl<O: Send + 'static> Command<O> {
    pub fn new(
        connection: Arc<MolerConnection>,
        command_string: impl Into<String>,
        timeout: Duration,
        parser: impl FnMut(&[u8]) -> Option<Result<O, ObserverError>> + Send + 'static,
    ) -> Arc<Self> {
        Self::new_with_guard(connection, command_string, timeout, parser, None)
    }

    /// Used by `Device::get_cmd` to install the state-check start-guard (see §9) at
    /// construction time, before the observer is handed to the caller.
    pub fn new_with_guard(
        connection: Arc<MolerConnection>,
        command_string: impl Into<String>,
        timeout: Duration,
        parser: impl FnMut(&[u8]) -> Option<Result<O, ObserverError>> + Send + 'static,
        start_guard: Option<StartGuard>,
    ) -> Arc<Self> {
        Arc::new(Command {
            core: ObserverCore::new(
                connection,
                ObserverKind::Command,
                Some(command_string.into()),
                timeout,
                start_guard,
            ),
            parser: Mutex::new(Box::new(parser)),
        })
    }

    pub fn result(&self) -> Option<O>
    where
        O: Clone,
    {
        mutex_lock_unwrap!(self.core.inner).result.clone()
    }

    pub fn exception(&self) -> Option<ObserverError> {
        mutex_lock_unwrap!(self.core.inner).exception.clone()
    }

    pub fn set_result(&self, value: O) {
        self.core
            .set_terminal(ObserverStatus::DoneOk, Some(value), None);
    }

    pub fn set_exception_terminal(&self, error: ObserverError) {
        self.core.set_terminal(ObserverStatus::DoneErr, None, Some(error));
    }

    /// Installs the `on_timeout` extension hook, fired exactly once if this command times out.
    pub fn set_on_timeout(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.core.set_on_timeout_hook(Box::new(hook));
    }
}

impl<O: Send + 'static> ObserverControl for Command<O> {
    fn kind(&self) -> ObserverKind {
        ObserverKind::Command
    }

    fn command_string(&self) -> Option<String> {
        self.core.command_string.clone()
    }

    fn connection(&self) -> Arc<MolerConnection> {
        Arc::clone(&self.core.connection)
    }

    fn subscriber_id(&self) -> SubscriberId {
        self.core.subscriber_id
    }

    fn status(&self) -> ObserverStatus {
        self.core.status()
    }

    fn start_time(&self) -> Option<Instant> {
        *mutex_lock_unwrap!(self.core.start_time)
    }

    fn timeout(&self) -> Duration {
        *mutex_lock_unwrap!(self.core.timeout)
    }

    fn set_timeout(&self, timeout: Duration) {
        *mutex_lock_unwrap!(self.core.timeout) = timeout;
    }

    fn start(&self) -> Result<(), ObserverError> {
        self.core.start()
    }

    fn data_received(&self, chunk: &[u8]) {
        if self.done() {
            return;
        }
        let outcome = {
            let mut parser = mutex_lock_unwrap!(self.parser);
            parser(chunk)
        };
        match outcome {
            Some(Ok(value)) => self.set_result(value),
            Some(Err(err)) => self.set_exception_terminal(err),
            None => {}
        }
    }

    fn cancel(&self) {
        self.core.set_terminal(ObserverStatus::Cancelled, None, Some(ObserverError::Cancelled));
    }

    fn mark_timed_out(&self) {
        let transitioned =
            self.core
                .set_terminal(ObserverStatus::TimedOut, None, Some(ObserverError::CommandTimeout));
        if transitioned {
            self.core.fire_on_timeout();
        }
    }

    fn set_on_timeout_hook(&self, hook: TimeoutHook) {
        self.core.set_on_timeout_hook(hook);
    }

    fn set_exception(&self, error: ObserverError) {
        self.core.set_terminal(ObserverStatus::DoneErr, None, Some(error));
    }
}

/// An Event observer: never writes, may fire (produce a result) many times before a terminal
/// transition; `parser` is invoked on every chunk and decides whether this occurrence terminates
/// the event or lets it keep observing. `occurrences` accumulates every fired value.
pub struct Event<O: Send + Clone + 'static> {
    core: ObserverCore<O>,
    parser: Mutex<Box<dyn FnMut(&[u8]) -> Option<O> + Send>>,
    occurrences: Mutex<Vec<O>>,
}

impl<O: Send + Clone + 'static> Event<O> {
    pub fn new(
        connection: Arc<MolerConnection>,
        timeout: Duration,
        parser: impl FnMut(&[u8]) -> Option<O> + Send + 'static,
    ) -> Arc<Self> {
        Self::new_with_guard(connection, timeout, parser, None)
    }

    pub fn new_with_guard(
        connection: Arc<MolerConnection>,
        timeout: Duration,
        parser: impl FnMut(&[u8]) -> Option<O> + Send + 'static,
        start_guard: Option<StartGuard>,
    ) -> Arc<Self> {
        Arc::new(Event {
            core: ObserverCore::new(connection, ObserverKind::Event, None, timeout, start_guard),
            parser: Mutex::new(Box::new(parser)),
            occurrences: Mutex::new(Vec::new()),
        })
    }

    pub fn occurrences(&self) -> Vec<O> {
        mutex_lock_unwrap!(self.occurrences).clone()
    }

    /// Installs the `on_timeout` extension hook, fired exactly once if this event times out.
    pub fn set_on_timeout(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.core.set_on_timeout_hook(Box::new(hook));
    }
}

impl<O: Send + Clone + 'static> ObserverControl for Event<O> {
    fn kind(&self) -> ObserverKind {
        ObserverKind::Event
    }

    fn command_string(&self) -> Option<String> {
        None
    }

    fn connection(&self) -> Arc<MolerConnection> {
        Arc::clone(&self.core.connection)
    }

    fn subscriber_id(&self) -> SubscriberId {
        self.core.subscriber_id
    }

    fn status(&self) -> ObserverStatus {
        self.core.status()
    }

    fn start_time(&self) -> Option<Instant> {
        *mutex_lock_unwrap!(self.core.start_time)
    }

    fn timeout(&self) -> Duration {
        *mutex_lock_unwrap!(self.core.timeout)
    }

    fn set_timeout(&self, timeout: Duration) {
        *mutex_lock_unwrap!(self.core.timeout) = timeout;
    }

    fn start(&self) -> Result<(), ObserverError> {
        self.core.start()
    }

    fn data_received(&self, chunk: &[u8]) {
        if self.done() {
            return;
        }
        let fired = {
            let mut parser = mutex_lock_unwrap!(self.parser);
            parser(chunk)
        };
        if let Some(value) = fired {
            mutex_lock_unwrap!(self.occurrences).push(value);
        }
    }

    fn cancel(&self) {
        self.core.set_terminal(ObserverStatus::Cancelled, None, Some(ObserverError::Cancelled));
    }

    fn mark_timed_out(&self) {
        let transitioned = self
            .core
            .set_terminal(ObserverStatus::TimedOut, None, Some(ObserverError::ObserverTimeout));
        if transitioned {
            self.core.fire_on_timeout();
        }
    }

    fn set_on_timeout_hook(&self, hook: TimeoutHook) {
        self.core.set_on_timeout_hook(hook);
    }

    fn set_exception(&self, error: ObserverError) {
        self.core.set_terminal(ObserverStatus::DoneErr, None, Some(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;

    fn connection() -> Arc<MolerConnection> {
        let (transport, _handle) = MemoryTransport::new_pair();
        Arc::new(MolerConnection::new(Box::new(transport)))
    }

    #[test]
    fn command_produces_result_on_match() {
        let cmd = Command::new(connection(), "echo hi", Duration::from_secs(1), |chunk: &[u8]| {
            let text = String::from_utf8_lossy(chunk);
            if text.lines().any(|line| line.trim() == "hi") {
                Some(Ok("hi".to_string()))
            } else {
                None
            }
        });
        cmd.start().unwrap();
        cmd.data_received(b"echo hi\r\n");
        assert_eq!(cmd.status(), ObserverStatus::Running);
        cmd.data_received(b"hi\r\nbash-5$ ");
        assert_eq!(cmd.status(), ObserverStatus::DoneOk);
        assert_eq!(cmd.result(), Some("hi".to_string()));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let cmd = Command::new(connection(), "echo hi", Duration::from_secs(1), |_: &[u8]| {
            Some(Ok("first".to_string()))
        });
        cmd.start().unwrap();
        cmd.data_received(b"anything");
        assert_eq!(cmd.result(), Some("first".to_string()));
        cmd.set_exception_terminal(ObserverError::CommandTimeout);
        // Already done_ok: the later terminal attempt must be a no-op.
        assert_eq!(cmd.status(), ObserverStatus::DoneOk);
        assert_eq!(cmd.result(), Some("first".to_string()));
    }

    #[test]
    fn double_start_fails() {
        let cmd = Command::new(connection(), "echo hi", Duration::from_secs(1), |_: &[u8]| None);
        cmd.start().unwrap();
        assert!(cmd.start().is_err());
    }

    #[test]
    fn on_timeout_hook_fires_exactly_once() {
        let cmd = Command::new(connection(), "echo hi", Duration::from_secs(1), |_: &[u8]| None);
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        cmd.set_on_timeout(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cmd.start().unwrap();

        let observer: Arc<dyn ObserverControl> = cmd.clone();
        observer.mark_timed_out();
        // A second forced timeout after the observer is already terminal must not re-fire the hook.
        observer.mark_timed_out();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cmd.status(), ObserverStatus::TimedOut);
    }

    #[test]
    fn on_timeout_hook_does_not_fire_when_result_wins_the_race() {
        let cmd = Command::new(connection(), "echo hi", Duration::from_secs(1), |chunk: &[u8]| {
            if chunk == b"hi" {
                Some(Ok("hi".to_string()))
            } else {
                None
            }
        });
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        cmd.set_on_timeout(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cmd.start().unwrap();
        cmd.data_received(b"hi");

        let observer: Arc<dyn ObserverControl> = cmd.clone();
        observer.mark_timed_out();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(cmd.status(), ObserverStatus::DoneOk);
    }

    #[test]
    fn event_fires_multiple_times() {
        let event = Event::new(connection(), Duration::from_secs(1), |chunk: &[u8]| {
            let text = String::from_utf8_lossy(chunk);
            if text.starts_with("ERR-") {
                Some(text.trim().to_string())
            } else {
                None
            }
        });
        event.start().unwrap();
        event.data_received(b"ERR-7");
        event.data_received(b"ok");
        event.data_received(b"ERR-12");
        assert_eq!(event.occurrences(), vec!["ERR-7".to_string(), "ERR-12".to_string()]);
        assert_eq!(event.status(), ObserverStatus::Running);
    }

    #[test]
    fn cancel_ignores_further_data() {
        let event = Event::new(connection(), Duration::from_secs(1), |_: &[u8]| Some("x".to_string()));
        event.start().unwrap();
        event.cancel();
        event.data_received(b"ignored");
        assert!(event.occurrences().is_empty());
        assert_eq!(event.status(), ObserverStatus::Cancelled);
    }
}
