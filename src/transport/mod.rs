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

//! The `Transport` contract: a bidirectional byte channel to one remote endpoint, with inbound
//! bytes pushed into an owning `MolerConnection` rather than pulled by the caller.
//!
//! Concrete transports (`tcp`, `ssh`, `telnet`) all follow the same shape: `open` performs the
//! blocking handshake and spawns a background reader thread; that thread blocks on the
//! underlying channel's read and forwards every non-empty chunk into the injector, bridging a
//! blocking-read channel to the push contract this module defines. `close` stops the reader
//! thread cooperatively and is idempotent.

pub mod memory;
pub mod ssh;
pub mod tcp;
pub mod telnet;

use std::sync::{Arc, Mutex};

use crate::error::ConnectionError;

/// When a lifecycle notification fires, relative to the transport's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    ConnectionMade,
    ConnectionLost,
}

/// Receives pushed inbound bytes. `MolerConnection` is the only production implementation;
/// tests may substitute a fake.
pub trait Injector: Send + Sync {
    fn data_received(&self, chunk: &[u8]);
}

impl Injector for crate::connection::MolerConnection {
    fn data_received(&self, chunk: &[u8]) {
        crate::connection::MolerConnection::data_received(self, chunk)
    }
}

/// A bidirectional byte channel to one remote endpoint.
pub trait Transport: Send {
    /// Blocking. Performs the handshake and starts the background reader thread that forwards
    /// inbound bytes to `injector`. Succeeds or raises an I/O error kind.
    fn open(&mut self, injector: Arc<dyn Injector>) -> Result<(), ConnectionError>;

    /// Idempotent. Stops the reader thread and releases the underlying channel.
    fn close(&mut self) -> Result<(), ConnectionError>;

    /// Synchronous write. Raises `RemoteEndpointNotConnected` if the transport is closed.
    fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError>;

    fn is_open(&self) -> bool;

    /// Registers a callback fired when the given lifecycle event occurs. Concrete transports
    /// may support any number of registered callbacks per `when`.
    fn notify(&mut self, when: When, callback: Box<dyn Fn() + Send>);

    fn remote_endpoint(&self) -> String;
}

/// Shared bookkeeping every concrete transport uses to track its reader thread. Not part of the
/// public contract; transports embed it.
pub(crate) struct ReaderHandle {
    pub(crate) stop_flag: Arc<std::sync::atomic::AtomicBool>,
    pub(crate) join_handle: Option<std::thread::JoinHandle<()>>,
}

impl ReaderHandle {
    pub(crate) fn stop(&mut self) {
        self.stop_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) on_connection_made: Vec<Box<dyn Fn() + Send>>,
    pub(crate) on_connection_lost: Vec<Box<dyn Fn() + Send>>,
}

impl Callbacks {
    pub(crate) fn fire(&self, when: When) {
        let list = match when {
            When::ConnectionMade => &self.on_connection_made,
            When::ConnectionLost => &self.on_connection_lost,
        };
        for callback in list {
            callback();
        }
    }

    pub(crate) fn register(&mut self, when: When, callback: Box<dyn Fn() + Send>) {
        match when {
            When::ConnectionMade => self.on_connection_made.push(callback),
            When::ConnectionLost => self.on_connection_lost.push(callback),
        }
    }
}

pub(crate) type SharedCallbacks = Arc<Mutex<Callbacks>>;

#[cfg(test)]
pub mod tests {
    //! Small transport-agnostic fakes reused by each concrete transport's own test module.
    use super::*;
    use std::time::Duration;

    pub struct RecordingInjector {
        pub chunks: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingInjector {
        pub fn new() -> Arc<Self> {
            Arc::new(RecordingInjector {
                chunks: Mutex::new(Vec::new()),
            })
        }
    }

    impl Injector for RecordingInjector {
        fn data_received(&self, chunk: &[u8]) {
            self.chunks.lock().unwrap().push(chunk.to_vec());
        }
    }

    pub fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }
}
