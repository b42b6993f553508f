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

use mbrace_common::config::{ConfigLoader, RetryConfig};
use mbrace_common::tracing::TracingConfig;
use mbrace_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub tracing: TracingConfig,
    pub replication: ReplicationConfig,
    pub dispatch_retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("mbrace-runtime"),
            replication: ReplicationConfig::default(),
            dispatch_retry: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for RuntimeConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "replication:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.replication.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "dispatch retry:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.dispatch_retry.to_safe_string_indented()
        );
        result
    }
}

/// Quorum policy for the task log and the record table.
/// `replication_factor` peers must acknowledge a synchronous write;
/// `failover_factor` peers may be lost before the replicated structure is
/// considered corrupt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub replication_factor: usize,
    pub failover_factor: usize,
    #[serde(with = "humantime_serde")]
    pub broadcast_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 2,
            failover_factor: 1,
            broadcast_timeout: Duration::from_secs(10),
        }
    }
}

impl SafeDisplay for ReplicationConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "replication factor: {}",
            self.replication_factor
        );
        let _ = writeln!(&mut result, "failover factor: {}", self.failover_factor);
        let _ = writeln!(
            &mut result,
            "broadcast timeout: {:?}",
            self.broadcast_timeout
        );
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<RuntimeConfig> {
    ConfigLoader::new(&PathBuf::from("config/mbrace-runtime.toml"))
}

#[cfg(test)]
mod tests {
    use crate::config::make_config_loader;
    use test_r::test;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }
}
