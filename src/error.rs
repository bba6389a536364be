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

//! Error taxonomy shared by every module in the crate.

use std::error::Error;
use std::fmt;
use std::io;

/// A catch-all error for conditions that should be unreachable under correct use: a poisoned
/// lock, a runner that failed to stop a feed-loop in time, a thread that failed to spawn.
#[derive(Debug)]
pub struct InternalError {
    message: Option<String>,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl InternalError {
    pub fn with_message(message: String) -> Self {
        InternalError {
            message: Some(message),
            source: None,
        }
    }

    pub fn from_source(source: Box<dyn Error + Send + Sync>) -> Self {
        InternalError {
            message: None,
            source: Some(source),
        }
    }

    pub fn from_source_with_message(source: Box<dyn Error + Send + Sync>, message: String) -> Self {
        InternalError {
            message: Some(message),
            source: Some(source),
        }
    }
}

impl Error for InternalError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|err| err.as_ref() as &(dyn Error + 'static))
    }
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.message, &self.source) {
            (Some(message), Some(source)) => write!(f, "{}: {}", message, source),
            (Some(message), None) => write!(f, "{}", message),
            (None, Some(source)) => write!(f, "{}", source),
            (None, None) => write!(f, "internal error"),
        }
    }
}

/// Transport-layer failures, surfaced through `MolerConnection` to every subscribed observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    NotConnected,
    Disconnected,
    Timeout,
    Io(String),
    Protocol(String),
}

impl Error for ConnectionError {}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionError::NotConnected => write!(f, "remote endpoint not connected"),
            ConnectionError::Disconnected => write!(f, "remote endpoint disconnected"),
            ConnectionError::Timeout => write!(f, "connection timed out"),
            ConnectionError::Io(err) => write!(f, "io error occurred: {}", err),
            ConnectionError::Protocol(err) => write!(f, "protocol error occurred: {}", err),
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
                ConnectionError::Disconnected
            }
            io::ErrorKind::TimedOut => ConnectionError::Timeout,
            _ => ConnectionError::Io(io_error.to_string()),
        }
    }
}

/// The terminal exception kind of a `done_err`, `cancelled`, or `timed_out` observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverError {
    CommandTimeout,
    ObserverTimeout,
    CommandWrongState { creation_state: String, current_state: String },
    EventWrongState { creation_state: String, current_state: String },
    Connection(ConnectionError),
    Cancelled,
    Parse(String),
}

impl Error for ObserverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ObserverError::Connection(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ObserverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObserverError::CommandTimeout => write!(f, "command timed out"),
            ObserverError::ObserverTimeout => write!(f, "event observer timed out"),
            ObserverError::CommandWrongState { creation_state, current_state } => write!(
                f,
                "command started in state '{}' but device is now in state '{}'",
                creation_state, current_state
            ),
            ObserverError::EventWrongState { creation_state, current_state } => write!(
                f,
                "event started in state '{}' but device is now in state '{}'",
                creation_state, current_state
            ),
            ObserverError::Connection(err) => write!(f, "connection error: {}", err),
            ObserverError::Cancelled => write!(f, "observer was cancelled"),
            ObserverError::Parse(err) => write!(f, "parse error: {}", err),
        }
    }
}

impl From<ConnectionError> for ObserverError {
    fn from(err: ConnectionError) -> Self {
        ObserverError::Connection(err)
    }
}

/// Errors surfaced by `Device` and `StateMachine`.
#[derive(Debug)]
pub enum DeviceError {
    WrongUsage(String),
    DeviceFailure(String),
    Observer(ObserverError),
    Internal(InternalError),
}

impl Error for DeviceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DeviceError::Observer(err) => Some(err),
            DeviceError::Internal(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceError::WrongUsage(msg) => write!(f, "wrong usage: {}", msg),
            DeviceError::DeviceFailure(msg) => write!(f, "device failure: {}", msg),
            DeviceError::Observer(err) => write!(f, "{}", err),
            DeviceError::Internal(err) => write!(f, "{}", err),
        }
    }
}

impl From<ObserverError> for DeviceError {
    fn from(err: ObserverError) -> Self {
        DeviceError::Observer(err)
    }
}

impl From<InternalError> for DeviceError {
    fn from(err: InternalError) -> Self {
        DeviceError::Internal(err)
    }
}

/// Errors surfaced by the `Scheduler`.
#[derive(Debug)]
pub enum SchedulerError {
    WrongUsage(String),
}

impl Error for SchedulerError {}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchedulerError::WrongUsage(msg) => write!(f, "wrong usage: {}", msg),
        }
    }
}
