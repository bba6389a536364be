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

//! Deserializable device configuration. This is an external collaborator: it reads a file into a
//! plain record and hands the pieces a caller needs to build a `Transport` and a `Device` — it
//! does not reach into `Device` internals beyond the constructor parameters those pieces feed.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::InternalError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Tcp { host: String, port: u16 },
    Telnet { host: String, port: u16 },
    Ssh {
        host: String,
        port: u16,
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
}

/// One named device's configuration: which transport to open, which state to treat as the
/// starting point, and which observer names are permitted in each state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default = "default_initial_state")]
    pub initial_state: String,
    #[serde(default)]
    pub allowed_cmds: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub allowed_events: HashMap<String, Vec<String>>,
}

fn default_initial_state() -> String {
    crate::state_machine::NOT_CONNECTED.to_string()
}

/// A named collection of `DeviceConfig` records, as loaded from one configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistry {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl DeviceRegistry {
    pub fn get(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.name == name)
    }
}

/// Reads a YAML or JSON device registry from `path`, dispatching on the file extension.
pub fn load_registry(path: impl AsRef<Path>) -> Result<DeviceRegistry, InternalError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|err| InternalError::from_source_with_message(Box::new(err), format!("failed to read {}", path.display())))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
            .map_err(|err| InternalError::from_source_with_message(Box::new(err), format!("failed to parse {}", path.display()))),
        _ => serde_json::from_str(&contents)
            .map_err(|err| InternalError::from_source_with_message(Box::new(err), format!("failed to parse {}", path.display()))),
    }
}
