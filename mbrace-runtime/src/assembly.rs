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
use mbrace_common::model::{AssemblyId, AssemblyImage, AssemblyLoadInfo};
use std::collections::HashMap;
use std::sync::Mutex;

/// Code-distribution collaborator. The runtime only passes dependency
/// manifests through; fetching, verification and loading happen elsewhere.
#[async_trait]
pub trait AssemblyManager: Send + Sync {
    async fn request_dependencies(
        &self,
        ids: &[AssemblyId],
    ) -> Result<Vec<AssemblyImage>, String>;

    async fn load_assemblies(
        &self,
        images: Vec<AssemblyImage>,
    ) -> Result<Vec<AssemblyLoadInfo>, String>;

    async fn assembly_load_info(
        &self,
        ids: &[AssemblyId],
    ) -> Result<Vec<AssemblyLoadInfo>, String>;
}

pub struct InMemoryAssemblyManager {
    assemblies: Mutex<HashMap<AssemblyId, AssemblyImage>>,
}

impl InMemoryAssemblyManager {
    pub fn new() -> InMemoryAssemblyManager {
        InMemoryAssemblyManager {
            assemblies: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAssemblyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssemblyManager for InMemoryAssemblyManager {
    async fn request_dependencies(
        &self,
        ids: &[AssemblyId],
    ) -> Result<Vec<AssemblyImage>, String> {
        let assemblies = self.assemblies.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| assemblies.get(id).cloned())
            .collect())
    }

    async fn load_assemblies(
        &self,
        images: Vec<AssemblyImage>,
    ) -> Result<Vec<AssemblyLoadInfo>, String> {
        let mut assemblies = self.assemblies.lock().unwrap();
        Ok(images
            .into_iter()
            .map(|image| {
                let id = image.id;
                assemblies.insert(id, image);
                AssemblyLoadInfo::Loaded(id)
            })
            .collect())
    }

    async fn assembly_load_info(
        &self,
        ids: &[AssemblyId],
    ) -> Result<Vec<AssemblyLoadInfo>, String> {
        let assemblies = self.assemblies.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| {
                if assemblies.contains_key(id) {
                    AssemblyLoadInfo::Loaded(*id)
                } else {
                    AssemblyLoadInfo::NotLoaded(*id)
                }
            })
            .collect())
    }
}
