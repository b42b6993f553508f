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
use crate::config::ReplicationConfig;
use crate::error::ProcessManagerError;
use crate::metrics;
use crate::monitor::{CompletionSink, ProcessMonitor};
use crate::pool::WorkerPool;
use crate::replication::{Replica, ReplicationMode, Replicator};
use crate::scheduler::{SchedulerFactory, SchedulerHandle, SchedulerMessage};
use crate::storage::ProcessArtifactStore;
use crate::task_manager::{TaskManager, TaskManagerHandle};
use crate::tasklog::{TaskLog, TaskLogOp};
use chrono::Utc;
use mbrace_common::config::RetryConfig;
use mbrace_common::model::{
    AssemblyId, AssemblyImage, AssemblyLoadInfo, ClientRequestId, ProcessId, ProcessImage,
    ProcessInfo, ProcessRecord, ProcessResult, ProcessState,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub enum ProcessManagerMessage {
    CreateDynamicProcess {
        reply: oneshot::Sender<Result<ProcessInfo, ProcessManagerError>>,
        request_id: ClientRequestId,
        image: ProcessImage,
    },
    GetProcessInfo {
        reply: oneshot::Sender<Result<ProcessInfo, ProcessManagerError>>,
        process_id: ProcessId,
    },
    GetAllProcessInfo {
        reply: oneshot::Sender<Result<Vec<ProcessInfo>, ProcessManagerError>>,
    },
    ClearProcessInfo {
        reply: oneshot::Sender<Result<(), ProcessManagerError>>,
        process_id: ProcessId,
    },
    ClearAllProcessInfo {
        reply: oneshot::Sender<Result<usize, ProcessManagerError>>,
    },
    KillProcess {
        reply: oneshot::Sender<Result<ProcessInfo, ProcessManagerError>>,
        process_id: ProcessId,
    },
    RequestDependencies {
        reply: oneshot::Sender<Result<Vec<AssemblyImage>, ProcessManagerError>>,
        ids: Vec<AssemblyId>,
    },
    LoadAssemblies {
        reply: oneshot::Sender<Result<Vec<AssemblyLoadInfo>, ProcessManagerError>>,
        images: Vec<AssemblyImage>,
    },
    GetAssemblyLoadInfo {
        reply: oneshot::Sender<Result<Vec<AssemblyLoadInfo>, ProcessManagerError>>,
        ids: Vec<AssemblyId>,
    },
}

#[derive(Clone)]
pub struct ProcessManagerHandle {
    sender: mpsc::UnboundedSender<ProcessManagerMessage>,
}

impl ProcessManagerHandle {
    fn unavailable() -> ProcessManagerError {
        ProcessManagerError::SystemFailed("process manager is not available".to_string())
    }

    pub async fn create_dynamic_process(
        &self,
        request_id: ClientRequestId,
        image: ProcessImage,
    ) -> Result<ProcessInfo, ProcessManagerError> {
        let (reply, receiver) = oneshot::channel();
        let _ = self.sender.send(ProcessManagerMessage::CreateDynamicProcess {
            reply,
            request_id,
            image,
        });
        receiver.await.map_err(|_| Self::unavailable())?
    }

    pub async fn get_process_info(
        &self,
        process_id: ProcessId,
    ) -> Result<ProcessInfo, ProcessManagerError> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .sender
            .send(ProcessManagerMessage::GetProcessInfo { reply, process_id });
        receiver.await.map_err(|_| Self::unavailable())?
    }

    pub async fn get_all_process_info(&self) -> Result<Vec<ProcessInfo>, ProcessManagerError> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .sender
            .send(ProcessManagerMessage::GetAllProcessInfo { reply });
        receiver.await.map_err(|_| Self::unavailable())?
    }

    pub async fn clear_process_info(
        &self,
        process_id: ProcessId,
    ) -> Result<(), ProcessManagerError> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .sender
            .send(ProcessManagerMessage::ClearProcessInfo { reply, process_id });
        receiver.await.map_err(|_| Self::unavailable())?
    }

    pub async fn clear_all_process_info(&self) -> Result<usize, ProcessManagerError> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .sender
            .send(ProcessManagerMessage::ClearAllProcessInfo { reply });
        receiver.await.map_err(|_| Self::unavailable())?
    }

    pub async fn kill_process(
        &self,
        process_id: ProcessId,
    ) -> Result<ProcessInfo, ProcessManagerError> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .sender
            .send(ProcessManagerMessage::KillProcess { reply, process_id });
        receiver.await.map_err(|_| Self::unavailable())?
    }

    pub async fn request_dependencies(
        &self,
        ids: Vec<AssemblyId>,
    ) -> Result<Vec<AssemblyImage>, ProcessManagerError> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .sender
            .send(ProcessManagerMessage::RequestDependencies { reply, ids });
        receiver.await.map_err(|_| Self::unavailable())?
    }

    pub async fn load_assemblies(
        &self,
        images: Vec<AssemblyImage>,
    ) -> Result<Vec<AssemblyLoadInfo>, ProcessManagerError> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .sender
            .send(ProcessManagerMessage::LoadAssemblies { reply, images });
        receiver.await.map_err(|_| Self::unavailable())?
    }

    pub async fn get_assembly_load_info(
        &self,
        ids: Vec<AssemblyId>,
    ) -> Result<Vec<AssemblyLoadInfo>, ProcessManagerError> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .sender
            .send(ProcessManagerMessage::GetAssemblyLoadInfo { reply, ids });
        receiver.await.map_err(|_| Self::unavailable())?
    }
}

struct ActiveProcess {
    task_manager: TaskManagerHandle,
    #[allow(dead_code)]
    scheduler: SchedulerHandle,
}

/// Cluster-singleton admission controller. Submissions are deduplicated by
/// client request id, records are replicated to quorum, and each admitted
/// process gets its own task-log/task-manager/scheduler trio. Replication
/// failures and other unexpected conditions trigger a system fault: the
/// client gets `SystemCorrupted`, the manager deactivates itself and raises
/// the cluster-wide failure signal.
pub struct ProcessManager {
    monitor: Arc<ProcessMonitor>,
    pool: Arc<WorkerPool>,
    scheduler_factory: Arc<dyn SchedulerFactory>,
    assemblies: Arc<dyn AssemblyManager>,
    artifacts: Arc<dyn ProcessArtifactStore>,
    task_log_replicas: Vec<Arc<dyn Replica<TaskLogOp>>>,
    replication: ReplicationConfig,
    retry: RetryConfig,
    fault_signal: FailureSignal,
    active: HashMap<ProcessId, ActiveProcess>,
    deactivated: bool,
}

impl ProcessManager {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        monitor: Arc<ProcessMonitor>,
        pool: Arc<WorkerPool>,
        scheduler_factory: Arc<dyn SchedulerFactory>,
        assemblies: Arc<dyn AssemblyManager>,
        artifacts: Arc<dyn ProcessArtifactStore>,
        task_log_replicas: Vec<Arc<dyn Replica<TaskLogOp>>>,
        replication: ReplicationConfig,
        retry: RetryConfig,
        fault_signal: FailureSignal,
    ) -> ProcessManagerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let manager = ProcessManager {
            monitor,
            pool,
            scheduler_factory,
            assemblies,
            artifacts,
            task_log_replicas,
            replication,
            retry,
            fault_signal,
            active: HashMap::new(),
            deactivated: false,
        };
        tokio::spawn(manager.run(receiver));
        ProcessManagerHandle { sender }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<ProcessManagerMessage>) {
        while let Some(message) = receiver.recv().await {
            self.handle(message).await;
            if self.deactivated {
                warn!("process manager deactivated after system fault");
                break;
            }
        }
        debug!("process manager stopped");
    }

    async fn handle(&mut self, message: ProcessManagerMessage) {
        match message {
            ProcessManagerMessage::CreateDynamicProcess {
                reply,
                request_id,
                image,
            } => {
                let result = self.create_dynamic_process(request_id, image).await;
                let _ = reply.send(result);
            }
            ProcessManagerMessage::GetProcessInfo { reply, process_id } => {
                let result = match self.monitor.get(&process_id) {
                    Some(record) => Ok(self.info_for(&record).await),
                    None => Err(ProcessManagerError::UnknownProcess(process_id)),
                };
                let _ = reply.send(result);
            }
            ProcessManagerMessage::GetAllProcessInfo { reply } => {
                let mut infos = Vec::new();
                for record in self.monitor.all() {
                    infos.push(self.info_for(&record).await);
                }
                let _ = reply.send(Ok(infos));
            }
            ProcessManagerMessage::ClearProcessInfo { reply, process_id } => {
                let result = self.clear_process_info(process_id).await;
                let _ = reply.send(result);
            }
            ProcessManagerMessage::ClearAllProcessInfo { reply } => {
                let result = self.clear_all_process_info().await;
                let _ = reply.send(result);
            }
            ProcessManagerMessage::KillProcess { reply, process_id } => {
                let result = self.kill_process(process_id).await;
                let _ = reply.send(result);
            }
            ProcessManagerMessage::RequestDependencies { reply, ids } => {
                let result = self
                    .assemblies
                    .request_dependencies(&ids)
                    .await
                    .map_err(ProcessManagerError::SystemFailed);
                let _ = reply.send(result);
            }
            ProcessManagerMessage::LoadAssemblies { reply, images } => {
                let result = self
                    .assemblies
                    .load_assemblies(images)
                    .await
                    .map_err(ProcessManagerError::SystemFailed);
                let _ = reply.send(result);
            }
            ProcessManagerMessage::GetAssemblyLoadInfo { reply, ids } => {
                let result = self
                    .assemblies
                    .assembly_load_info(&ids)
                    .await
                    .map_err(ProcessManagerError::SystemFailed);
                let _ = reply.send(result);
            }
        }
    }

    async fn create_dynamic_process(
        &mut self,
        request_id: ClientRequestId,
        image: ProcessImage,
    ) -> Result<ProcessInfo, ProcessManagerError> {
        if let Some(existing) = self.monitor.find_by_request(&request_id) {
            debug!(
                request_id = %request_id,
                process_id = %existing.process_id,
                "duplicate submission, returning existing record"
            );
            return Ok(self.info_for(&existing).await);
        }

        if image.computation.is_empty() {
            return Err(ProcessManagerError::InvalidRequest(
                "submitted computation is empty".to_string(),
            ));
        }

        let process_id = ProcessId::new_v4();
        let record = ProcessRecord {
            process_id,
            request_id,
            name: image.name.clone(),
            type_name: image.type_name.clone(),
            return_type: image.return_type.clone(),
            client_id: image.client_id.clone(),
            dependencies: image.dependencies.clone(),
            state: ProcessState::Initialized,
            created_at: Utc::now(),
            started_at: None,
            result: None,
        };
        if let Err(err) = self
            .monitor
            .upsert(record.clone(), ReplicationMode::Sync)
            .await
        {
            return Err(self.trigger_system_fault(format!(
                "failed to persist process record: {err}"
            )));
        }
        info!(process_id = %process_id, name = %record.name, "process admitted");

        let log = Arc::new(TaskLog::new(
            process_id,
            Replicator::new(self.task_log_replicas.clone(), &self.replication),
        ));
        let task_manager = TaskManager::spawn(
            process_id,
            log,
            self.pool.clone(),
            self.monitor.clone(),
            self.retry.clone(),
            record.dependencies.clone(),
        );
        let completion = CompletionSink::new(self.monitor.clone(), process_id);

        let scheduler = match self
            .scheduler_factory
            .activate(process_id, task_manager.clone(), completion)
            .await
        {
            Ok(scheduler) => scheduler,
            Err(err) => {
                warn!(process_id = %process_id, %err, "process activation failed");
                let _ = self
                    .monitor
                    .update(
                        process_id,
                        |record| {
                            record.state = ProcessState::Failed;
                            record.result =
                                Some(ProcessResult::InitError(err.to_string()));
                        },
                        ReplicationMode::Async,
                    )
                    .await;
                task_manager.shutdown().await;
                return Err(err.into());
            }
        };

        // two-phase wiring: both sides exist before the reference is injected
        task_manager.set_scheduler(scheduler.clone());
        if let Err(err) = self
            .monitor
            .transition(process_id, ProcessState::Created, ReplicationMode::Async)
            .await
        {
            return Err(self.trigger_system_fault(format!(
                "failed to persist process state: {err}"
            )));
        }

        scheduler.send(SchedulerMessage::NewProcess {
            process_id,
            body: image.computation,
        });

        let running = self
            .monitor
            .update(
                process_id,
                |record| {
                    if record.state.can_transition(&ProcessState::Running) {
                        record.state = ProcessState::Running;
                    }
                    record.started_at = Some(Utc::now());
                },
                ReplicationMode::Sync,
            )
            .await;
        let record = match running {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(ProcessManagerError::UnknownProcess(process_id));
            }
            Err(err) => {
                return Err(self.trigger_system_fault(format!(
                    "failed to persist process state: {err}"
                )));
            }
        };

        self.active.insert(
            process_id,
            ActiveProcess {
                task_manager,
                scheduler,
            },
        );
        metrics::record_process_created();
        Ok(self.info_for(&record).await)
    }

    async fn kill_process(
        &mut self,
        process_id: ProcessId,
    ) -> Result<ProcessInfo, ProcessManagerError> {
        let record = self
            .monitor
            .get(&process_id)
            .ok_or(ProcessManagerError::UnknownProcess(process_id))?;
        if record.state.is_terminal() {
            return Ok(self.info_for(&record).await);
        }

        // the replicated record is marked first; deactivation then cascades
        // cancellation to every outstanding task
        let killed = self
            .monitor
            .finish(process_id, ProcessResult::Killed, ReplicationMode::Sync)
            .await;
        let record = match killed {
            Ok(Some(record)) => record,
            Ok(None) => return Err(ProcessManagerError::UnknownProcess(process_id)),
            Err(err) => {
                return Err(
                    self.trigger_system_fault(format!("failed to persist kill: {err}"))
                );
            }
        };

        if let Some(active) = self.active.remove(&process_id) {
            active.task_manager.shutdown().await;
        }
        info!(process_id = %process_id, "process killed");
        metrics::record_process_killed();
        Ok(self.info_for(&record).await)
    }

    async fn clear_process_info(
        &mut self,
        process_id: ProcessId,
    ) -> Result<(), ProcessManagerError> {
        let record = self
            .monitor
            .get(&process_id)
            .ok_or(ProcessManagerError::UnknownProcess(process_id))?;
        if !record.state.is_terminal() {
            return Err(ProcessManagerError::ProcessStillRunning(process_id));
        }
        self.active.remove(&process_id);
        if let Err(err) = self.artifacts.delete_artifacts(&process_id).await {
            warn!(process_id = %process_id, %err, "failed to delete process artifacts");
        }
        match self.monitor.remove(process_id, ReplicationMode::Sync).await {
            Ok(_) => Ok(()),
            Err(err) => Err(self.trigger_system_fault(format!(
                "failed to clear process record: {err}"
            ))),
        }
    }

    async fn clear_all_process_info(&mut self) -> Result<usize, ProcessManagerError> {
        let terminal: Vec<ProcessId> = self
            .monitor
            .all()
            .into_iter()
            .filter(|record| record.state.is_terminal())
            .map(|record| record.process_id)
            .collect();
        let mut cleared = 0;
        for process_id in terminal {
            self.clear_process_info(process_id).await?;
            cleared += 1;
        }
        Ok(cleared)
    }

    async fn info_for(&self, record: &ProcessRecord) -> ProcessInfo {
        let task_count = match self.active.get(&record.process_id) {
            Some(active) => active.task_manager.active_task_count().await,
            None => 0,
        };
        record.info(self.pool.available_worker_count(), task_count)
    }

    fn trigger_system_fault(&mut self, details: String) -> ProcessManagerError {
        error!(%details, "system fault, deactivating process manager");
        metrics::record_system_fault();
        self.deactivated = true;
        self.fault_signal.fail(details);
        ProcessManagerError::SystemCorrupted
    }
}
