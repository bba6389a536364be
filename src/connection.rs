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

//! `MolerConnection` multiplexes one transport's byte stream out to many subscribers, and
//! multiplexes outbound writes back down to the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::ConnectionError;
use crate::transport::{Injector, Transport};

/// Identifies one subscriber slot. Handed back by `subscribe` so the same logical receiver can
/// be removed later; re-subscribing the same id is a no-op rather than a duplicate delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriberId {
    pub fn new() -> Self {
        SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Receiver = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct SubscriberMap {
    subscribers: HashMap<SubscriberId, Receiver>,
}

impl SubscriberMap {
    fn subscribe(&mut self, id: SubscriberId, receiver: Receiver) {
        self.subscribers.entry(id).or_insert(receiver);
    }

    fn unsubscribe(&mut self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }

    /// A cheap clone of the current subscriber set. Cloning `Arc`s (rather than holding the lock
    /// during delivery) is what gives `data_received` its snapshot semantics: a subscribe or
    /// unsubscribe racing a delivery lands entirely before or entirely after this clone.
    fn snapshot(&self) -> Vec<Receiver> {
        self.subscribers.values().cloned().collect()
    }
}

/// Thin broker wrapping one `Transport`. Inbound bytes pushed by the transport are fanned out to
/// every current subscriber; outbound text is written through `send_line`.
pub struct MolerConnection {
    transport: Mutex<Box<dyn Transport>>,
    subscribers: Mutex<SubscriberMap>,
    line_terminator: String,
}

impl MolerConnection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        MolerConnection {
            transport: Mutex::new(transport),
            subscribers: Mutex::new(SubscriberMap::default()),
            line_terminator: "\n".to_string(),
        }
    }

    pub fn with_line_terminator(transport: Box<dyn Transport>, line_terminator: impl Into<String>) -> Self {
        MolerConnection {
            transport: Mutex::new(transport),
            subscribers: Mutex::new(SubscriberMap::default()),
            line_terminator: line_terminator.into(),
        }
    }

    /// Idempotent: subscribing the same id twice only installs the receiver once.
    pub fn subscribe(&self, id: SubscriberId, receiver: Receiver) {
        debug!("subscribing receiver {:?}", id);
        let mut subscribers = mutex_lock_unwrap!(self.subscribers);
        subscribers.subscribe(id, receiver);
    }

    /// Idempotent: unsubscribing an unknown id is a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        debug!("unsubscribing receiver {:?}", id);
        let mut subscribers = mutex_lock_unwrap!(self.subscribers);
        subscribers.unsubscribe(id);
    }

    /// Invoked by the owning `Transport`'s reader thread. Delivers a snapshot of the subscriber
    /// set installed at the moment this call started; a failing receiver (one that panics) does
    /// not prevent delivery to the others.
    pub fn data_received(&self, chunk: &[u8]) {
        let snapshot = {
            let subscribers = mutex_lock_unwrap!(self.subscribers);
            subscribers.snapshot()
        };
        for receiver in snapshot {
            // Receivers are pure parsers and are expected not to panic, but a poisoned observer
            // mutex or a bug in a concrete parser must not take down delivery to the rest of the
            // subscriber set.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| receiver(chunk)));
        }
    }

    pub fn send_line(&self, text: &str) -> Result<(), ConnectionError> {
        let mut line = String::with_capacity(text.len() + self.line_terminator.len());
        line.push_str(text);
        line.push_str(&self.line_terminator);
        self.send(line.as_bytes())
    }

    pub fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let mut transport = mutex_lock_unwrap!(self.transport);
        transport.send(bytes)
    }

    pub fn is_open(&self) -> bool {
        let transport = mutex_lock_unwrap!(self.transport);
        transport.is_open()
    }

    /// Opens the underlying transport, wiring its pushed bytes back into `this`. Takes the `Arc`
    /// rather than `&self` because the transport's reader thread needs an owned `Arc<dyn
    /// Injector>` that outlives this call.
    pub fn open(this: &Arc<Self>) -> Result<(), ConnectionError> {
        let injector: Arc<dyn Injector> = Arc::clone(this) as Arc<dyn Injector>;
        let mut transport = mutex_lock_unwrap!(this.transport);
        transport.open(injector)
    }

    pub fn close(&self) -> Result<(), ConnectionError> {
        let mut transport = mutex_lock_unwrap!(self.transport);
        transport.close()
    }
}
