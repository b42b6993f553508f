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

pub mod assembly;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod process_manager;
pub mod protocol;
pub mod replication;
pub mod scheduler;
pub mod storage;
pub mod task_manager;
pub mod tasklog;

#[cfg(test)]
test_r::enable!();
