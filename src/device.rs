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

//! `Device` owns one `MolerConnection` and one `StateMachine` and is the only thing callers
//! construct directly. It *has* a state machine rather than inheriting state-machine-library
//! behavior through a mixin, and its permitted command/event names are an explicit table handed
//! in at construction rather than discovered by scanning a package for matching classes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::connection::MolerConnection;
use crate::error::{ConnectionError, DeviceError, ObserverError};
use crate::observer::{Command, Event, ObserverControl, ObserverKind, StartGuard};
use crate::runner::{Runner, SubmissionHandle};
use crate::state_machine::{StateMachine, CONNECTED, NOT_CONNECTED};
use crate::transport::{Transport, When};

/// Which command/event names are permitted in which state. Handed to `Device::new` and fixed for
/// the device's lifetime — not discovered by introspecting a package for eligible classes.
pub type NameTable = HashMap<String, HashSet<String>>;

pub struct Device {
    connection: Arc<MolerConnection>,
    state_machine: Arc<StateMachine>,
    runner: Arc<dyn Runner>,
    allowed_cmds: NameTable,
    allowed_events: NameTable,
    active: Arc<Mutex<Vec<Weak<dyn ObserverControl>>>>,
}

impl Device {
    /// Opens `transport` and wires its lifecycle notifications to this device's state machine:
    /// `connection_made` moves `current` to `CONNECTED`; `connection_lost` moves it back to
    /// `NOT_CONNECTED` and fails every observer still tracked as active with a disconnect error.
    pub fn new(
        mut transport: Box<dyn Transport>,
        runner: Arc<dyn Runner>,
        allowed_cmds: NameTable,
        allowed_events: NameTable,
    ) -> Result<Arc<Self>, DeviceError> {
        let state_machine = Arc::new(StateMachine::new(NOT_CONNECTED));
        let active: Arc<Mutex<Vec<Weak<dyn ObserverControl>>>> = Arc::new(Mutex::new(Vec::new()));

        let sm_made = Arc::clone(&state_machine);
        transport.notify(
            When::ConnectionMade,
            Box::new(move || sm_made.force_state(CONNECTED)),
        );

        let sm_lost = Arc::clone(&state_machine);
        let active_lost = Arc::clone(&active);
        transport.notify(
            When::ConnectionLost,
            Box::new(move || {
                sm_lost.force_state(NOT_CONNECTED);
                let observers = mutex_lock_unwrap!(active_lost);
                for weak in observers.iter() {
                    if let Some(observer) = weak.upgrade() {
                        observer.set_exception(ObserverError::Connection(ConnectionError::Disconnected));
                    }
                }
            }),
        );

        let connection = Arc::new(MolerConnection::new(transport));
        MolerConnection::open(&connection)
            .map_err(|err| DeviceError::DeviceFailure(format!("failed to open transport: {}", err)))?;

        Ok(Arc::new(Device {
            connection,
            state_machine,
            runner,
            allowed_cmds,
            allowed_events,
            active,
        }))
    }

    pub fn connection(&self) -> Arc<MolerConnection> {
        Arc::clone(&self.connection)
    }

    pub fn current_state(&self) -> String {
        self.state_machine.current_state()
    }

    pub fn state_machine(&self) -> Arc<StateMachine> {
        Arc::clone(&self.state_machine)
    }

    pub fn goto_state(&self, dst: &str) -> Result<(), DeviceError> {
        self.state_machine.goto_state(dst)
    }

    fn start_guard(&self, creation_state: String, kind: ObserverKind) -> StartGuard {
        let state_machine = Arc::clone(&self.state_machine);
        Box::new(move || {
            let current_state = state_machine.current_state();
            if current_state == creation_state {
                return Ok(());
            }
            Err(match kind {
                ObserverKind::Command => ObserverError::CommandWrongState {
                    creation_state: creation_state.clone(),
                    current_state,
                },
                ObserverKind::Event => ObserverError::EventWrongState {
                    creation_state: creation_state.clone(),
                    current_state,
                },
            })
        })
    }

    /// Looks up `name` in `allowed_cmds[current_state]`; `WrongUsage` if absent. When
    /// `check_state` is set, the returned command carries a start guard that rejects `start()` if
    /// the device has left the state it was constructed in.
    pub fn get_cmd<O: Send + 'static>(
        &self,
        name: &str,
        command_string: impl Into<String>,
        timeout: Duration,
        parser: impl FnMut(&[u8]) -> Option<Result<O, ObserverError>> + Send + 'static,
        check_state: bool,
    ) -> Result<Arc<Command<O>>, DeviceError> {
        let state = self.state_machine.current_state();
        self.check_allowed(&self.allowed_cmds, &state, name)?;
        let guard = check_state.then(|| self.start_guard(state, ObserverKind::Command));
        Ok(Command::new_with_guard(
            Arc::clone(&self.connection),
            command_string,
            timeout,
            parser,
            guard,
        ))
    }

    pub fn get_event<O: Send + Clone + 'static>(
        &self,
        name: &str,
        timeout: Duration,
        parser: impl FnMut(&[u8]) -> Option<O> + Send + 'static,
        check_state: bool,
    ) -> Result<Arc<Event<O>>, DeviceError> {
        let state = self.state_machine.current_state();
        self.check_allowed(&self.allowed_events, &state, name)?;
        let guard = check_state.then(|| self.start_guard(state, ObserverKind::Event));
        Ok(Event::new_with_guard(Arc::clone(&self.connection), timeout, parser, guard))
    }

    fn check_allowed(&self, table: &NameTable, state: &str, name: &str) -> Result<(), DeviceError> {
        let permitted = table.get(state).map(|names| names.contains(name)).unwrap_or(false);
        if permitted {
            Ok(())
        } else {
            Err(DeviceError::WrongUsage(format!(
                "'{}' is not allowed in state '{}'",
                name, state
            )))
        }
    }

    /// Starts `observer`, submits it to this device's `Runner`, and tracks it so a later
    /// `connection_lost` can fail it if it is still in flight.
    pub fn submit(&self, observer: Arc<dyn ObserverControl>) -> Result<SubmissionHandle, DeviceError> {
        if let Err(err) = observer.start() {
            error!("observer failed to start: {}", err);
            return Err(DeviceError::Observer(err));
        }
        info!(
            "observer started: {:?} {}",
            observer.kind(),
            observer.command_string().unwrap_or_default()
        );
        let handle = self.runner.submit(Arc::clone(&observer)).map_err(|err| {
            error!("observer submission rejected: {}", err);
            DeviceError::Observer(err)
        })?;
        mutex_lock_unwrap!(self.active).push(Arc::downgrade(&observer));
        Ok(handle)
    }

    pub fn wait_for(&self, handle: &SubmissionHandle, timeout: Option<Duration>) {
        self.runner.wait_for(handle, timeout)
    }

    /// `get_cmd(...); start(); await_done()` in one call.
    pub fn run<O: Send + Clone + 'static>(
        &self,
        name: &str,
        command_string: impl Into<String>,
        timeout: Duration,
        parser: impl FnMut(&[u8]) -> Option<Result<O, ObserverError>> + Send + 'static,
    ) -> Result<O, DeviceError> {
        let cmd = self.get_cmd(name, command_string, timeout, parser, true)?;
        let handle = self.submit(Arc::clone(&cmd) as Arc<dyn ObserverControl>)?;
        self.wait_for(&handle, None);
        match cmd.exception() {
            Some(err) => Err(DeviceError::Observer(err)),
            None => cmd
                .result()
                .ok_or_else(|| DeviceError::DeviceFailure(format!("command '{}' finished without a result", name))),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::cooperative::CooperativeRunner;
    use crate::transport::memory::MemoryTransport;

    fn allowed(state: &str, names: &[&str]) -> NameTable {
        let mut table = NameTable::new();
        table.insert(
            state.to_string(),
            names.iter().map(|name| name.to_string()).collect(),
        );
        table
    }

    #[test]
    fn transport_open_moves_device_to_connected() {
        let (transport, _handle) = MemoryTransport::new_pair();
        let runner: Arc<dyn Runner> = Arc::new(CooperativeRunner::new());
        let device = Device::new(
            Box::new(transport),
            runner,
            NameTable::new(),
            NameTable::new(),
        )
        .unwrap();
        assert_eq!(device.current_state(), CONNECTED);
    }

    #[test]
    fn get_cmd_rejects_unknown_name() {
        let (transport, _handle) = MemoryTransport::new_pair();
        let runner: Arc<dyn Runner> = Arc::new(CooperativeRunner::new());
        let device = Device::new(
            Box::new(transport),
            runner,
            NameTable::new(),
            NameTable::new(),
        )
        .unwrap();

        let result = device.get_cmd::<String>("whoami", "whoami", Duration::from_secs(1), |_: &[u8]| None, true);
        assert!(matches!(result, Err(DeviceError::WrongUsage(_))));
    }

    #[test]
    fn run_executes_command_and_returns_parsed_result() {
        let (transport, handle) = MemoryTransport::new_pair();
        let runner: Arc<dyn Runner> = Arc::new(CooperativeRunner::new());
        let device = Device::new(
            Box::new(transport),
            runner,
            allowed(CONNECTED, &["whoami"]),
            NameTable::new(),
        )
        .unwrap();

        let device_for_thread = Arc::clone(&device);
        let run_handle = std::thread::spawn(move || {
            device_for_thread.run::<String>("whoami", "whoami", Duration::from_secs(2), |chunk: &[u8]| {
                let text = String::from_utf8_lossy(chunk);
                text.lines()
                    .find(|line| line.trim() == "root")
                    .map(|_| Ok("root".to_string()))
            })
        });

        // Keep redelivering the reply until the command's subscriber has attached and consumed
        // it, since the command starts (and subscribes) on the spawned thread asynchronously.
        for _ in 0..100 {
            handle.push(b"root\r\n");
            if run_handle.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(run_handle.join().unwrap().unwrap(), "root".to_string());
    }

    #[test]
    fn connection_lost_fails_active_observer() {
        let (transport, handle) = MemoryTransport::new_pair();
        let runner: Arc<dyn Runner> = Arc::new(CooperativeRunner::new());
        let device = Device::new(
            Box::new(transport),
            runner,
            allowed(CONNECTED, &["sleep"]),
            NameTable::new(),
        )
        .unwrap();

        let cmd = device
            .get_cmd::<String>("sleep", "sleep 100", Duration::from_secs(30), |_: &[u8]| None, false)
            .unwrap();
        let observer: Arc<dyn ObserverControl> = Arc::clone(&cmd) as Arc<dyn ObserverControl>;
        let _submission = device.submit(observer).unwrap();

        // Dropping the test's handle drops the reader thread's inbound channel, which the reader
        // loop reports as a disconnect the same way a real socket EOF would be reported.
        drop(handle);

        assert!(crate::transport::tests::wait_until(
            || cmd.exception().is_some(),
            Duration::from_secs(1)
        ));
        assert_eq!(
            cmd.exception(),
            Some(ObserverError::Connection(ConnectionError::Disconnected))
        );
        assert_eq!(device.current_state(), NOT_CONNECTED);
    }
}
