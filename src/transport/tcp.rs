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

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::ConnectionError;
use crate::transport::{Callbacks, Injector, ReaderHandle, SharedCallbacks, Transport, When};

const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 4096;

pub struct TcpTransport {
    address: String,
    receive_buffer_size: usize,
    stream: Option<TcpStream>,
    reader: Option<ReaderHandle>,
    open: Arc<AtomicBool>,
    callbacks: SharedCallbacks,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        TcpTransport {
            address: address.into(),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            stream: None,
            reader: None,
            open: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
        }
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, injector: Arc<dyn Injector>) -> Result<(), ConnectionError> {
        let stream = TcpStream::connect(&self.address)?;
        stream.set_read_timeout(Some(Duration::from_millis(50)))?;
        let reader_stream = stream.try_clone()?;
        self.stream = Some(stream);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader_stop = Arc::clone(&stop_flag);
        let callbacks = Arc::clone(&self.callbacks);
        let open_flag = Arc::clone(&self.open);
        let buffer_size = self.receive_buffer_size;

        let join_handle = thread::Builder::new()
            .name("tcp-transport-reader".into())
            .spawn(move || {
                read_loop(reader_stream, buffer_size, reader_stop, injector, callbacks, open_flag)
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
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?;
        stream.write_all(bytes)?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn notify(&mut self, when: When, callback: Box<dyn Fn() + Send>) {
        self.callbacks.lock().unwrap().register(when, callback);
    }

    fn remote_endpoint(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

fn read_loop(
    mut stream: TcpStream,
    buffer_size: usize,
    stop_flag: Arc<AtomicBool>,
    injector: Arc<dyn Injector>,
    callbacks: SharedCallbacks,
    open_flag: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; buffer_size];
    while !stop_flag.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => {
                open_flag.store(false, Ordering::SeqCst);
                callbacks.lock().unwrap().fire(When::ConnectionLost);
                break;
            }
            Ok(n) => injector.data_received(&buf[..n]),
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(_) => {
                open_flag.store(false, Ordering::SeqCst);
                callbacks.lock().unwrap().fire(When::ConnectionLost);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::{wait_until, RecordingInjector};
    use std::io::Read as _;
    use std::net::TcpListener;

    #[test]
    fn round_trips_bytes_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(b"bash-5$ ").unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).unwrap();
            buf[..n].to_vec()
        });

        let mut transport = TcpTransport::new(addr.to_string());
        let injector = RecordingInjector::new();
        transport.open(injector.clone()).unwrap();

        transport.send(b"echo hi\n").unwrap();

        assert!(wait_until(
            || !injector.chunks.lock().unwrap().is_empty(),
            Duration::from_secs(2)
        ));

        let echoed = server.join().unwrap();
        assert_eq!(echoed, b"echo hi\n");

        transport.close().unwrap();
    }
}
