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

//! Telnet is a raw TCP stream plus inline option-negotiation bytes (RFC 854's `IAC` sequences)
//! the device never wants to see in its text stream. This transport strips them out before
//! pushing bytes to the injector and answers every negotiation request with `WONT`/`DONT`,
//! which is sufficient for a plain text shell session.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::ConnectionError;
use crate::transport::{Callbacks, Injector, ReaderHandle, SharedCallbacks, Transport, When};

const IAC: u8 = 255;
const WILL: u8 = 251;
const WONT: u8 = 252;
const DO: u8 = 253;
const DONT: u8 = 254;
const SB: u8 = 250;
const SE: u8 = 240;

const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 4096;

pub struct TelnetTransport {
    address: String,
    receive_buffer_size: usize,
    stream: Option<TcpStream>,
    reader: Option<ReaderHandle>,
    open: Arc<AtomicBool>,
    callbacks: SharedCallbacks,
}

impl TelnetTransport {
    pub fn new(address: impl Into<String>) -> Self {
        TelnetTransport {
            address: address.into(),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            stream: None,
            reader: None,
            open: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
        }
    }
}

impl Transport for TelnetTransport {
    fn open(&mut self, injector: Arc<dyn Injector>) -> Result<(), ConnectionError> {
        let stream = TcpStream::connect(&self.address)?;
        stream.set_read_timeout(Some(Duration::from_millis(50)))?;
        let reader_stream = stream.try_clone()?;
        let reply_stream = stream.try_clone()?;
        self.stream = Some(stream);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader_stop = Arc::clone(&stop_flag);
        let callbacks = Arc::clone(&self.callbacks);
        let open_flag = Arc::clone(&self.open);
        let buffer_size = self.receive_buffer_size;

        let join_handle = thread::Builder::new()
            .name("telnet-transport-reader".into())
            .spawn(move || {
                read_loop(
                    reader_stream,
                    reply_stream,
                    buffer_size,
                    reader_stop,
                    injector,
                    callbacks,
                    open_flag,
                )
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
        let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
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
        format!("telnet://{}", self.address)
    }
}

/// Strips `IAC` negotiation sequences out of `buf`, replying `WONT`/`DONT` to any `WILL`/`DO`
/// request, and returns the remaining plain-text bytes.
fn strip_negotiation(buf: &[u8], reply: &mut impl Write) -> Vec<u8> {
    let mut text = Vec::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != IAC {
            text.push(buf[i]);
            i += 1;
            continue;
        }
        if i + 1 >= buf.len() {
            break;
        }
        match buf[i + 1] {
            WILL | WONT | DO | DONT if i + 2 < buf.len() => {
                let option = buf[i + 2];
                let response = match buf[i + 1] {
                    WILL | WONT => DONT,
                    _ => WONT,
                };
                let _ = reply.write_all(&[IAC, response, option]);
                i += 3;
            }
            SB => {
                // Skip subnegotiation until IAC SE.
                let mut j = i + 2;
                while j + 1 < buf.len() && !(buf[j] == IAC && buf[j + 1] == SE) {
                    j += 1;
                }
                i = j + 2;
            }
            _ => i += 2,
        }
    }
    text
}

fn read_loop(
    mut stream: TcpStream,
    mut reply: TcpStream,
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
            Ok(n) => {
                let text = strip_negotiation(&buf[..n], &mut reply);
                if !text.is_empty() {
                    injector.data_received(&text);
                }
            }
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

    #[test]
    fn strips_will_and_replies_dont() {
        let mut reply = Vec::new();
        let text = strip_negotiation(&[IAC, WILL, 1, b'h', b'i'], &mut reply);
        assert_eq!(text, b"hi");
        assert_eq!(reply, vec![IAC, DONT, 1]);
    }

    #[test]
    fn skips_subnegotiation_block() {
        let mut reply = Vec::new();
        let input = [IAC, SB, 31, 0, 80, 0, 24, IAC, SE, b'o', b'k'];
        let text = strip_negotiation(&input, &mut reply);
        assert_eq!(text, b"ok");
        assert!(reply.is_empty());
    }

    #[test]
    fn passes_through_plain_text() {
        let mut reply = Vec::new();
        let text = strip_negotiation(b"plain text", &mut reply);
        assert_eq!(text, b"plain text");
    }
}
