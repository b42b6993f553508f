// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub env_filter: String,
    pub json: bool,
    pub ansi: bool,
    pub without_time: bool,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> TracingConfig {
        TracingConfig {
            service_name: service_name.to_string(),
            env_filter: "info".to_string(),
            json: false,
            ansi: true,
            without_time: false,
        }
    }

    pub fn test_pretty_without_time(service_name: &str) -> TracingConfig {
        TracingConfig {
            service_name: service_name.to_string(),
            env_filter: "debug".to_string(),
            json: false,
            ansi: true,
            without_time: true,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig::local_dev("mbrace")
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "service name: {}", self.service_name);
        let _ = writeln!(&mut result, "env filter: {}", self.env_filter);
        let _ = writeln!(&mut result, "json: {}", self.json);
        result
    }
}

/// Initializes the global subscriber; `RUST_LOG` wins over the configured
/// filter. Safe to call more than once (subsequent calls are no-ops), so
/// test dependencies can share it.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.env_filter.clone()));

    if config.json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    } else if config.without_time {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.ansi)
            .without_time()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.ansi)
            .try_init();
    }
}
