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

use async_trait::async_trait;
use mbrace_common::model::ProcessId;
use std::collections::HashMap;
use std::sync::Mutex;

/// Cloud-storage collaborator holding per-process artifacts (user logs,
/// spilled values). The runtime deletes a process' artifacts best-effort
/// when its record is cleared; deletion failures are logged, never fatal.
#[async_trait]
pub trait ProcessArtifactStore: Send + Sync {
    async fn delete_artifacts(&self, process_id: &ProcessId) -> Result<(), String>;
}

pub struct InMemoryArtifactStore {
    artifacts: Mutex<HashMap<ProcessId, Vec<(String, Vec<u8>)>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> InMemoryArtifactStore {
        InMemoryArtifactStore {
            artifacts: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, process_id: ProcessId, key: &str, value: Vec<u8>) {
        self.artifacts
            .lock()
            .unwrap()
            .entry(process_id)
            .or_default()
            .push((key.to_string(), value));
    }

    pub fn contains(&self, process_id: &ProcessId) -> bool {
        self.artifacts.lock().unwrap().contains_key(process_id)
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessArtifactStore for InMemoryArtifactStore {
    async fn delete_artifacts(&self, process_id: &ProcessId) -> Result<(), String> {
        self.artifacts.lock().unwrap().remove(process_id);
        Ok(())
    }
}
