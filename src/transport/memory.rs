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

//! An in-process transport pair used by tests: one side is driven as a `Transport` by the code
//! under test, the other is a plain handle the test holds to script inbound bytes and observe
//! outbound writes, without touching a real socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::ConnectionError;
use crate::transport::{Callbacks, Injector, ReaderHandle, SharedCallbacks, Transport, When};

/// The test-facing half of a `MemoryTransport` pair: push bytes in, read what was sent out.
pub struct MemoryTransportHandle {
    inbound_tx: Sender<Vec<u8>>,
    outbound_rx: Mutex<Receiver<Vec<u8>>>,
}

impl MemoryTransportHandle {
    pub fn push(&self, bytes: &[u8]) {
        let _ = self.inbound_tx.send(bytes.to_vec());
    }

    pub fn sent(&self) -> Vec<u8> {
        let rx = self.outbound_rx.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend(chunk);
        }
        out
    }

    pub fn try_recv_sent(&self, timeout: Duration) -> Option<Vec<u8>> {
        let rx = self.outbound_rx.lock().unwrap();
        rx.recv_timeout(timeout).ok()
    }
}

pub struct MemoryTransport {
    inbound_rx: Option<Receiver<Vec<u8>>>,
    outbound_tx: Sender<Vec<u8>>,
    open: Arc<AtomicBool>,
    reader: Option<ReaderHandle>,
    callbacks: SharedCallbacks,
}

impl MemoryTransport {
    pub fn new_pair() -> (MemoryTransport, MemoryTransportHandle) {
        let (inbound_tx, inbound_rx) = channel();
        let (outbound_tx, outbound_rx) = channel();
        let transport = MemoryTransport {
            inbound_rx: Some(inbound_rx),
            outbound_tx,
            open: Arc::new(AtomicBool::new(false)),
            reader: None,
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
        };
        let handle = MemoryTransportHandle {
            inbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
        };
        (transport, handle)
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, injector: Arc<dyn Injector>) -> Result<(), ConnectionError> {
        let inbound_rx = self
            .inbound_rx
            .take()
            .ok_or_else(|| ConnectionError::Protocol("transport already opened".into()))?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader_stop = Arc::clone(&stop_flag);
        let callbacks = Arc::clone(&self.callbacks);
        let open_flag = Arc::clone(&self.open);

        let join_handle = thread::Builder::new()
            .name("memory-transport-reader".into())
            .spawn(move || {
                while !reader_stop.load(Ordering::SeqCst) {
                    match inbound_rx.recv_timeout(Duration::from_millis(10)) {
                        Ok(chunk) => injector.data_received(&chunk),
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                            open_flag.store(false, Ordering::SeqCst);
                            callbacks.lock().unwrap().fire(When::ConnectionLost);
                            break;
                        }
                    }
                }
            })
            .map_err(|err| ConnectionError::Io(err.to_string()))?;

        self.reader = Some(ReaderHandle {
            stop_flag,
            join_handle: Some(join_handle),
        });
        self.open.store(true, Ordering::SeqCst);
        self.callbacks.lock().unwrap().fire(When::ConnectionMade);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::NotConnected);
        }
        self.outbound_tx
            .send(bytes.to_vec())
            .map_err(|_| ConnectionError::Disconnected)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn notify(&mut self, when: When, callback: Box<dyn Fn() + Send>) {
        self.callbacks.lock().unwrap().register(when, callback);
    }

    fn remote_endpoint(&self) -> String {
        "memory://test".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::{wait_until, RecordingInjector};

    #[test]
    fn open_then_push_delivers_to_injector() {
        let (mut transport, handle) = MemoryTransport::new_pair();
        let injector = RecordingInjector::new();
        transport.open(injector.clone()).unwrap();

        handle.push(b"hello");

        assert!(wait_until(
            || !injector.chunks.lock().unwrap().is_empty(),
            Duration::from_millis(500)
        ));
        assert_eq!(*injector.chunks.lock().unwrap(), vec![b"hello".to_vec()]);

        transport.close().unwrap();
    }

    #[test]
    fn send_after_close_fails() {
        let (mut transport, _handle) = MemoryTransport::new_pair();
        let injector = RecordingInjector::new();
        transport.open(injector).unwrap();
        transport.close().unwrap();

        match transport.send(b"x") {
            Err(ConnectionError::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other),
        }
    }

    #[test]
    fn sent_bytes_are_observable_on_handle() {
        let (mut transport, handle) = MemoryTransport::new_pair();
        let injector = RecordingInjector::new();
        transport.open(injector).unwrap();

        transport.send(b"echo hi\n").unwrap();

        assert_eq!(
            handle.try_recv_sent(Duration::from_millis(500)),
            Some(b"echo hi\n".to_vec())
        );
        transport.close().unwrap();
    }
}
