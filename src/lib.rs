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

//! A concurrent observation engine for driving interactive shell sessions (SSH, Telnet, raw TCP):
//! commands and events are parsed off a shared byte stream by a pluggable `Runner`, and a
//! `Device` composes a `MolerConnection` with a `StateMachine` to model a session as it hops
//! between prompts.

#[macro_use]
extern crate log;

#[macro_export]
macro_rules! mutex_lock_unwrap {
    ($lock:expr) => {
        match $lock.lock() {
            Ok(guard) => guard,
            Err(e) => panic!("Mutex error: {:?}", e),
        }
    };
}

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod observer;
pub mod runner;
pub mod scheduler;
pub mod state_machine;
pub mod threading;
pub mod transport;
