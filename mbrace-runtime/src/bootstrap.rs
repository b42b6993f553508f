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

use crate::assembly::AssemblyManager;
use crate::cluster::FailureSignal;
use crate::config::{ReplicationConfig, RuntimeConfig};
use crate::monitor::{ProcessMonitor, RecordOp};
use crate::pool::WorkerPool;
use crate::process_manager::{ProcessManager, ProcessManagerHandle};
use crate::replication::{Replica, Replicator};
use crate::scheduler::SchedulerFactory;
use crate::storage::ProcessArtifactStore;
use crate::tasklog::TaskLogOp;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub pool: Arc<WorkerPool>,
    pub monitor: Arc<ProcessMonitor>,
    pub process_manager: ProcessManagerHandle,
    pub assemblies: Arc<dyn AssemblyManager>,
    pub artifacts: Arc<dyn ProcessArtifactStore>,
    pub fault_signal: FailureSignal,
}

impl Services {
    pub fn new(
        config: &RuntimeConfig,
        replication: &ReplicationConfig,
        task_log_replicas: Vec<Arc<dyn Replica<TaskLogOp>>>,
        record_replicas: Vec<Arc<dyn Replica<RecordOp>>>,
        scheduler_factory: Arc<dyn SchedulerFactory>,
        assemblies: Arc<dyn AssemblyManager>,
        artifacts: Arc<dyn ProcessArtifactStore>,
    ) -> Services {
        let pool = Arc::new(WorkerPool::new());
        let monitor = Arc::new(ProcessMonitor::new(Replicator::new(
            record_replicas,
            replication,
        )));
        let fault_signal = FailureSignal::new();

        let process_manager = ProcessManager::spawn(
            monitor.clone(),
            pool.clone(),
            scheduler_factory,
            assemblies.clone(),
            artifacts.clone(),
            task_log_replicas,
            replication.clone(),
            config.dispatch_retry.clone(),
            fault_signal.clone(),
        );

        Services {
            pool,
            monitor,
            process_manager,
            assemblies,
            artifacts,
            fault_signal,
        }
    }
}
