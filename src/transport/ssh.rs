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

//! SSH transport opening an interactive shell channel over `ssh2`. Host-key verification
//! defaults to "accept new" (the moment-of-first-contact policy `paramiko.AutoAddPolicy` uses)
//! and is the caller's responsibility to harden for production use.
//!
//! The channel is shared between the reader thread and `send()` behind one mutex: `ssh2::Channel`
//! has no built-in split, and the underlying session multiplexes all channels over a single
//! non-blocking socket, so reads and writes must already serialize through something.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ssh2::{Channel, Session};

use crate::error::ConnectionError;
use crate::transport::{Callbacks, Injector, ReaderHandle, SharedCallbacks, Transport, When};

const DEFAULT_PORT: u16 = 22;
const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 4096;

pub struct SshTransport {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    receive_buffer_size: usize,
    session: Option<Session>,
    channel: Option<Arc<Mutex<Channel>>>,
    reader: Option<ReaderHandle>,
    open: Arc<AtomicBool>,
    callbacks: SharedCallbacks,
}

impl SshTransport {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        SshTransport {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: None,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            session: None,
            channel: None,
            reader: None,
            open: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }
}

impl Transport for SshTransport {
    fn open(&mut self, injector: Arc<dyn Injector>) -> Result<(), ConnectionError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))?;
        tcp.set_read_timeout(Some(Duration::from_millis(50)))?;

        let mut session = Session::new()
            .map_err(|err| ConnectionError::Protocol(format!("failed to create ssh session: {}", err)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|err| ConnectionError::Protocol(format!("ssh handshake failed: {}", err)))?;

        // Host-key verification defaults to "accept new": the session's known_hosts is left
        // empty, matching the moler AutoAddPolicy default this transport mirrors. Callers that
        // need strict verification should populate `session.known_hosts()` before `open`.

        if let Some(password) = &self.password {
            session
                .userauth_password(&self.username, password)
                .map_err(|err| ConnectionError::Protocol(format!("ssh auth failed: {}", err)))?;
        } else {
            session
                .userauth_agent(&self.username)
                .map_err(|err| ConnectionError::Protocol(format!("ssh agent auth failed: {}", err)))?;
        }

        let mut raw_channel = session
            .channel_session()
            .map_err(|err| ConnectionError::Protocol(format!("failed to open channel: {}", err)))?;
        raw_channel
            .request_pty("xterm", None, None)
            .map_err(|err| ConnectionError::Protocol(format!("failed to request pty: {}", err)))?;
        raw_channel
            .shell()
            .map_err(|err| ConnectionError::Protocol(format!("failed to start shell: {}", err)))?;
        session.set_blocking(false);

        let channel = Arc::new(Mutex::new(raw_channel));

        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader_stop = Arc::clone(&stop_flag);
        let callbacks = Arc::clone(&self.callbacks);
        let open_flag = Arc::clone(&self.open);
        let buffer_size = self.receive_buffer_size;
        let reader_channel = Arc::clone(&channel);

        let join_handle = thread::Builder::new()
            .name("ssh-transport-reader".into())
            .spawn(move || read_loop(reader_channel, buffer_size, reader_stop, injector, callbacks, open_flag))
            .map_err(|err| ConnectionError::Io(err.to_string()))?;

        self.reader = Some(ReaderHandle {
            stop_flag,
            join_handle: Some(join_handle),
        });
        self.channel = Some(channel);
        self.session = Some(session);
        self.open.store(true, Ordering::SeqCst);
        self.callbacks.lock().unwrap().fire(When::ConnectionMade);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        self.channel = None;
        self.session = None;
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let channel = self.channel.as_ref().ok_or(ConnectionError::NotConnected)?;
        let mut channel = mutex_lock_unwrap!(channel);
        channel
            .write_all(bytes)
            .map_err(|err| ConnectionError::Io(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn notify(&mut self, when: When, callback: Box<dyn Fn() + Send>) {
        self.callbacks.lock().unwrap().register(when, callback);
    }

    fn remote_endpoint(&self) -> String {
        format!("ssh://{}@{}:{}", self.username, self.host, self.port)
    }
}

fn read_loop(
    channel: Arc<Mutex<Channel>>,
    buffer_size: usize,
    stop_flag: Arc<AtomicBool>,
    injector: Arc<dyn Injector>,
    callbacks: SharedCallbacks,
    open_flag: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; buffer_size];
    while !stop_flag.load(Ordering::SeqCst) {
        let outcome = {
            let mut channel = mutex_lock_unwrap!(channel);
            channel.read(&mut buf)
        };
        match outcome {
            Ok(0) => {
                let eof = mutex_lock_unwrap!(channel).eof();
                if eof {
                    open_flag.store(false, Ordering::SeqCst);
                    callbacks.lock().unwrap().fire(When::ConnectionLost);
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            Ok(n) => injector.data_received(&buf[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => {
                open_flag.store(false, Ordering::SeqCst);
                callbacks.lock().unwrap().fire(When::ConnectionLost);
                break;
            }
        }
    }
}
